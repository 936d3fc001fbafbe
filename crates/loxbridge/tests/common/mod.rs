#![allow(dead_code)]

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use loxbridge::{Error, GuestMemory, KillSwitch, OutputCallback, Result, Runtime, RuntimeFactory};
use tracing_subscriber::EnvFilter;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Counters shared by every runtime a [`ScriptedFactory`] creates.
#[derive(Debug, Default)]
pub struct Stats {
    pub created: AtomicUsize,
    pub initialized: AtomicUsize,
    pub live_buffers: AtomicUsize,
    pub executions: AtomicUsize,
}

impl Stats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub stats: Arc<Stats>,
    pub fail_init: bool,
}

impl ScriptedFactory {
    pub fn tracked() -> (Self, Arc<Stats>) {
        let factory = Self::default();
        let stats = Arc::clone(&factory.stats);
        (factory, stats)
    }

    pub fn failing() -> Self {
        Self {
            fail_init: true,
            ..Self::default()
        }
    }
}

impl RuntimeFactory for ScriptedFactory {
    type Runtime = ScriptedRuntime;

    fn create(&self, kill: KillSwitch) -> Result<ScriptedRuntime> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedRuntime {
            // Address 0 stays unused, like a real allocator's null.
            heap: vec![0; 8],
            stats: Arc::clone(&self.stats),
            kill,
            fail_init: self.fail_init,
        })
    }
}

/// A toy interpreter over a growable byte heap.
///
/// Understands `;`-separated statements:
/// - `print A+B` prints the sum, `print "text"` prints the text
/// - `print <name>` reports an undefined variable on the error stream
/// - `while (true) {}` spins until the session is torn down
/// - `fault` fails the execution call itself
/// - `panic` panics inside the execution call
pub struct ScriptedRuntime {
    heap: Vec<u8>,
    stats: Arc<Stats>,
    kill: KillSwitch,
    fail_init: bool,
}

impl ScriptedRuntime {
    fn source_at(&self, address: u32) -> Result<String> {
        let start = address as usize;
        let tail = self.heap.get(start..).ok_or(Error::OutOfBounds {
            address,
            length: 0,
        })?;
        let len = tail.iter().position(|b| *b == 0).ok_or(Error::OutOfBounds {
            address,
            length: u32::try_from(tail.len()).unwrap_or(u32::MAX),
        })?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    fn emit(&mut self, callback: &mut dyn OutputCallback, text: &str, is_error: bool) -> Result<()> {
        let address = u32::try_from(self.heap.len()).expect("heap fits in u32");
        let length = u32::try_from(text.len()).expect("output fits in u32");
        self.heap.extend_from_slice(text.as_bytes());
        callback.on_output(&self.heap, address, length, is_error)
    }

    fn spin(&self) -> Result<()> {
        while !self.kill.is_triggered() {
            thread::sleep(Duration::from_millis(1));
        }
        Err(Error::Terminated)
    }
}

fn evaluate(expr: &str) -> std::result::Result<String, String> {
    if let Some(text) = expr.strip_prefix('"').and_then(|e| e.strip_suffix('"')) {
        return Ok(text.to_string());
    }
    let sum: Option<i64> = expr
        .split('+')
        .map(|term| term.trim().parse::<i64>().ok())
        .sum();
    sum.map(|n| n.to_string())
        .ok_or_else(|| format!("Undefined variable '{}'.", expr.trim()))
}

impl GuestMemory for ScriptedRuntime {
    fn allocate(&mut self, byte_length: u32) -> Result<u32> {
        let address = u32::try_from(self.heap.len()).map_err(|_| Error::Allocation(byte_length))?;
        self.heap.resize(self.heap.len() + byte_length as usize, 0xAA);
        self.stats.live_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(address)
    }

    fn release(&mut self, _address: u32) -> Result<()> {
        self.stats.live_buffers.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn data(&self) -> &[u8] {
        &self.heap
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.heap
    }
}

impl Runtime for ScriptedRuntime {
    fn initialize(&mut self) -> Result<()> {
        if self.fail_init {
            return Err(Error::Wasm(anyhow::anyhow!("interpreter failed to boot")));
        }
        self.stats.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&mut self, address: u32, mut callback: Box<dyn OutputCallback>) -> Result<()> {
        self.stats.executions.fetch_add(1, Ordering::SeqCst);
        let source = self.source_at(address)?;

        for statement in source.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if statement == "while (true) {}" {
                return self.spin();
            }
            if statement == "panic" {
                panic!("interpreter state corrupted");
            }
            if statement == "fault" {
                return Err(Error::Wasm(anyhow::anyhow!("unreachable executed")));
            }
            let Some(expr) = statement.strip_prefix("print ") else {
                return self.emit(callback.as_mut(), &format!("Unexpected '{statement}'."), true);
            };
            match evaluate(expr) {
                Ok(text) => self.emit(callback.as_mut(), &text, false)?,
                Err(message) => return self.emit(callback.as_mut(), &message, true),
            }
        }
        Ok(())
    }
}

/// Poll `cond` until it holds or [`TEST_TIMEOUT`] elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("condition not reached within {TEST_TIMEOUT:?}"))
}
