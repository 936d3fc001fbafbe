/// Worker thread settings shared by every session a controller spawns.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub(crate) thread_name: String,
    pub(crate) stack_size: Option<usize>,
}

impl SessionConfig {
    pub const DEFAULT_THREAD_NAME: &'static str = "loxbridge-worker";

    /// Prefix for worker thread names; the session id is appended.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Stack size of worker threads. Deeply recursive guests may need more
    /// than the platform default.
    #[must_use]
    pub const fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thread_name: Self::DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }
}

/// Export and import names the host binds in a guest module.
///
/// Defaults match the interpreter's browser build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestAbi {
    pub memory: String,
    pub alloc: String,
    pub free: String,
    pub run: String,
    /// Called once after instantiation; skipped when the guest lacks it.
    pub init: Option<String>,
    pub print_module: String,
    pub print_name: String,
}

impl Default for GuestAbi {
    fn default() -> Self {
        Self {
            memory: "memory".to_string(),
            alloc: "malloc".to_string(),
            free: "free".to_string(),
            run: "lox_run_src".to_string(),
            init: Some("init_vm".to_string()),
            print_module: "env".to_string(),
            print_name: "js_vm_print".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WasmConfig {
    pub max_memory: usize,
    pub abi: GuestAbi,
}

impl WasmConfig {
    pub const DEFAULT_MAX_MEMORY: usize = 64 * 1024 * 1024;
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            max_memory: Self::DEFAULT_MAX_MEMORY,
            abi: GuestAbi::default(),
        }
    }
}
