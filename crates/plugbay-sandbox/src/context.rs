//! Sandboxed execution context.
//!
//! [`SandboxContext`] is the isolation primitive: one per concurrently
//! loaded plugin.  The plugin's Wasm module runs inside a wasmtime [`Store`]
//! owned by a dedicated OS thread, so a runaway guest burns its own thread,
//! never a runtime worker.  Enforcement lives at the host boundary:
//!
//! - **CPU** -- fuel metering; the per-call budget derives from the
//!   manifest's CPU ceiling.
//! - **Wall clock** -- epoch interruption; a shared ticker advances the
//!   engine epoch every millisecond and each call sets its own deadline.
//! - **Memory** -- a [`ResourceLimiter`] that refuses any growth beyond the
//!   manifest's heap ceiling.
//! - **Capabilities** -- the only imports the guest sees are the `plugbay`
//!   host functions, each gated by the [`PermissionPolicy`] before anything
//!   is observable.  There is no WASI, no ambient filesystem, no sockets.
//!
//! The guest side of the protocol is a single optional export:
//! `handle_hook(kind: i32, payload_ptr: i32, payload_len: i32) -> i32`.
//! A module that does not export it simply never handles hooks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use wasmtime::{Caller, Engine, Linker, Memory, Module, ResourceLimiter, Store, Trap, TypedFunc};

use crate::error::{Result, SandboxError};
use crate::policy::PermissionPolicy;
use crate::protocol::{ContextRequest, ContextResponse, HookOutcome, RequestKind};
use crate::worker::ResourceUsage;

/// Build the shared wasmtime engine and start its epoch ticker.
///
/// The ticker thread holds only a weak engine reference; it exits once the
/// last strong reference (the pool) is dropped.
pub(crate) fn build_engine() -> Result<Engine> {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    config.wasm_memory64(false);

    let engine = Engine::new(&config)
        .map_err(|e| SandboxError::Compilation(format!("failed to create wasm engine: {e}")))?;

    let weak = engine.weak();
    std::thread::Builder::new()
        .name("plugbay-epoch".into())
        .spawn(move || {
            while let Some(engine) = weak.upgrade() {
                engine.increment_epoch();
                drop(engine);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .map_err(|e| SandboxError::SandboxCrash {
            reason: format!("failed to spawn epoch ticker: {e}"),
        })?;

    tracing::debug!("sandbox engine initialized");
    Ok(engine)
}

/// Per-context state stored in the wasmtime [`Store`].
struct HostState {
    /// The immutable policy bound at context creation.
    policy: Arc<PermissionPolicy>,
    /// Buffer where the guest writes its JSON result via `host_set_result`.
    output: Vec<u8>,
    /// Set when a host import denies an operation; classification reads it
    /// back after the resulting trap surfaces.
    violation: Option<SandboxError>,
    /// Set when the memory limiter refused a growth request.
    heap_exceeded: bool,
}

impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired as u64 > self.policy.max_heap_bytes() {
            self.heap_exceeded = true;
            return Err(wasmtime::Error::msg("memory ceiling exceeded"));
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= 100_000)
    }
}

/// A live guest instance: the store, its exports, and the optional hook
/// entry point.
struct Session {
    store: Store<HostState>,
    memory: Option<Memory>,
    hook_fn: Option<TypedFunc<(i32, i32, i32), i32>>,
}

struct Envelope {
    req: ContextRequest,
    reply: oneshot::Sender<ContextResponse>,
}

/// One isolated execution context hosting at most one plugin.
pub struct SandboxContext {
    tx: mpsc::Sender<Envelope>,
    next_id: AtomicU64,
    call_timeout: Duration,
    usage: Arc<Mutex<ResourceUsage>>,
}

impl SandboxContext {
    /// Spawn the context thread.
    ///
    /// The policy is bound here, before any plugin code runs; compilation
    /// and instantiation happen later, when the `Load` request arrives.
    pub(crate) fn spawn(
        engine: Engine,
        module_bytes: Vec<u8>,
        policy: Arc<PermissionPolicy>,
        plugin: String,
        call_grace: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let usage = Arc::new(Mutex::new(ResourceUsage::default()));
        let call_timeout = Duration::from_millis(policy.timeout_ms()) + call_grace;

        let thread_usage = Arc::clone(&usage);
        std::thread::Builder::new()
            .name(format!("plugbay-ctx-{plugin}"))
            .spawn(move || {
                context_thread(engine, module_bytes, policy, plugin, thread_usage, rx);
            })
            .map_err(|e| SandboxError::SandboxCrash {
                reason: format!("failed to spawn context thread: {e}"),
            })?;

        Ok(Self {
            tx,
            next_id: AtomicU64::new(1),
            call_timeout,
            usage,
        })
    }

    /// Send one request frame and await its correlated response.
    ///
    /// A missing response within the call timeout is a [`SandboxError::SandboxCrash`];
    /// the context is assumed dead and the caller must fault the worker.
    pub async fn call(&self, kind: RequestKind) -> Result<HookOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Envelope {
                req: ContextRequest { id, kind },
                reply: reply_tx,
            })
            .map_err(|_| SandboxError::SandboxCrash {
                reason: "context thread is gone".into(),
            })?;

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Err(_) => Err(SandboxError::SandboxCrash {
                reason: format!("no response within {}ms", self.call_timeout.as_millis()),
            }),
            Ok(Err(_)) => Err(SandboxError::SandboxCrash {
                reason: "context dropped the reply channel".into(),
            }),
            Ok(Ok(response)) => {
                debug_assert_eq!(response.id, id);
                response.outcome
            }
        }
    }

    /// Copy of the most recent resource-usage snapshot.
    pub fn usage(&self) -> ResourceUsage {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Context thread
// ---------------------------------------------------------------------------

fn context_thread(
    engine: Engine,
    module_bytes: Vec<u8>,
    policy: Arc<PermissionPolicy>,
    plugin: String,
    usage: Arc<Mutex<ResourceUsage>>,
    rx: mpsc::Receiver<Envelope>,
) {
    let spawned = Instant::now();
    let mut session: Option<Session> = None;

    while let Ok(envelope) = rx.recv() {
        let id = envelope.req.id;
        let kind = envelope.req.kind;
        let is_unload = matches!(kind, RequestKind::Unload);

        let outcome = dispatch(&engine, &module_bytes, &policy, &mut session, kind);

        if let Some(active) = session.as_mut() {
            record_usage(&usage, active, &policy, spawned);
        }

        let fatal = matches!(&outcome, Err(e) if e.faults_worker());
        if fatal {
            tracing::warn!(plugin = %plugin, error = ?outcome, "context faulted");
            session = None;
        }

        let _ = envelope.reply.send(ContextResponse { id, outcome });

        if is_unload {
            session = None;
        }
        if fatal {
            break;
        }
    }

    tracing::debug!(plugin = %plugin, "context thread exiting");
}

fn dispatch(
    engine: &Engine,
    module_bytes: &[u8],
    policy: &Arc<PermissionPolicy>,
    session: &mut Option<Session>,
    kind: RequestKind,
) -> Result<HookOutcome> {
    match kind {
        RequestKind::Load => {
            if session.is_some() {
                return Err(SandboxError::Execution("plugin is already loaded".into()));
            }
            let mut fresh = instantiate(engine, module_bytes, policy)?;
            let outcome = invoke_hook(&mut fresh, policy, &RequestKind::Load);
            if outcome.is_ok() {
                *session = Some(fresh);
            }
            outcome
        }
        other => {
            let Some(active) = session.as_mut() else {
                return Err(SandboxError::Execution("no live plugin instance".into()));
            };
            invoke_hook(active, policy, &other)
        }
    }
}

fn instantiate(
    engine: &Engine,
    module_bytes: &[u8],
    policy: &Arc<PermissionPolicy>,
) -> Result<Session> {
    let module = Module::new(engine, module_bytes)
        .map_err(|e| SandboxError::Compilation(e.to_string()))?;

    let state = HostState {
        policy: Arc::clone(policy),
        output: Vec::new(),
        violation: None,
        heap_exceeded: false,
    };
    let mut store = Store::new(engine, state);
    store.limiter(|s| s as &mut dyn ResourceLimiter);
    store
        .set_fuel(policy.fuel_budget())
        .map_err(|e| SandboxError::Instantiation(e.to_string()))?;
    store.set_epoch_deadline(policy.timeout_ms().max(1));

    let mut linker: Linker<HostState> = Linker::new(engine);
    define_host_imports(&mut linker)?;

    let instance = match linker.instantiate(&mut store, &module) {
        Ok(instance) => instance,
        Err(e) => return Err(classify(&mut store, policy, e)),
    };

    let memory = instance.get_memory(&mut store, "memory");
    let hook_fn = instance
        .get_typed_func::<(i32, i32, i32), i32>(&mut store, "handle_hook")
        .ok();

    Ok(Session {
        store,
        memory,
        hook_fn,
    })
}

fn invoke_hook(
    session: &mut Session,
    policy: &Arc<PermissionPolicy>,
    kind: &RequestKind,
) -> Result<HookOutcome> {
    let Some(hook_fn) = session.hook_fn.clone() else {
        return Ok(HookOutcome::NotHandled);
    };

    let payload = serde_json::to_vec(&kind.payload())
        .map_err(|e| SandboxError::Execution(format!("payload encoding failed: {e}")))?;

    // Fresh budgets for this invocation.
    session
        .store
        .set_fuel(policy.fuel_budget())
        .map_err(|e| SandboxError::Execution(e.to_string()))?;
    session.store.set_epoch_deadline(policy.timeout_ms().max(1));
    {
        let state = session.store.data_mut();
        state.output.clear();
        state.violation = None;
    }

    // Write the payload at offset 0 of the guest memory, if it has one.
    let (payload_ptr, payload_len) = match session.memory {
        Some(memory) => {
            let data = memory.data_mut(&mut session.store);
            if payload.len() > data.len() {
                return Err(SandboxError::Execution(format!(
                    "payload of {} bytes exceeds guest memory",
                    payload.len()
                )));
            }
            data[..payload.len()].copy_from_slice(&payload);
            (0i32, payload.len() as i32)
        }
        None => (0i32, 0i32),
    };

    let discriminant = kind.hook_kind().discriminant();
    let rc = match hook_fn.call(&mut session.store, (discriminant, payload_ptr, payload_len)) {
        Ok(rc) => rc,
        Err(e) => return Err(classify(&mut session.store, policy, e)),
    };

    if rc != 0 {
        return Err(SandboxError::Execution(format!(
            "hook returned non-zero code: {rc}"
        )));
    }

    let output = &session.store.data().output;
    if output.is_empty() {
        return Ok(HookOutcome::Handled(serde_json::Value::Null));
    }
    serde_json::from_slice(output)
        .map(HookOutcome::Handled)
        .map_err(|e| SandboxError::Execution(format!("invalid result JSON: {e}")))
}

/// Translate a wasmtime error into the sandbox fault taxonomy.
///
/// The order matters: a denied memory grow and a denied host call both
/// surface as traps, so the host-side flags take precedence over the
/// generic trap code.
fn classify(
    store: &mut Store<HostState>,
    policy: &Arc<PermissionPolicy>,
    err: wasmtime::Error,
) -> SandboxError {
    let state = store.data_mut();

    if state.heap_exceeded {
        return SandboxError::ResourceLimitExceeded {
            resource: "heap",
            limit: policy.max_heap_bytes(),
        };
    }
    if let Some(violation) = state.violation.take() {
        return violation;
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match trap {
            Trap::OutOfFuel => SandboxError::ResourceLimitExceeded {
                resource: "cpu",
                limit: policy.fuel_budget(),
            },
            Trap::Interrupt => SandboxError::Timeout {
                limit_ms: policy.timeout_ms(),
            },
            _ => SandboxError::Trap(err.to_string()),
        };
    }
    SandboxError::Trap(err.to_string())
}

fn record_usage(
    usage: &Arc<Mutex<ResourceUsage>>,
    session: &mut Session,
    policy: &Arc<PermissionPolicy>,
    spawned: Instant,
) {
    let heap_bytes = session
        .memory
        .map(|m| m.data_size(&session.store) as u64)
        .unwrap_or(0);
    let fuel_consumed = policy
        .fuel_budget()
        .saturating_sub(session.store.get_fuel().unwrap_or(0));

    if let Ok(mut snapshot) = usage.lock() {
        snapshot.heap_bytes = heap_bytes;
        snapshot.fuel_consumed = snapshot.fuel_consumed.saturating_add(fuel_consumed);
        snapshot.age_ms = spawned.elapsed().as_millis() as u64;
    }
}

// ---------------------------------------------------------------------------
// Host imports -- the guest's entire capability surface
// ---------------------------------------------------------------------------

fn define_host_imports(linker: &mut Linker<HostState>) -> Result<()> {
    let wrap_err = |e: wasmtime::Error| SandboxError::Instantiation(e.to_string());

    // host_log: structured log line from the guest.
    linker
        .func_wrap(
            "plugbay",
            "host_log",
            |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                if let Some(msg) = read_guest_string(&mut caller, ptr, len) {
                    match level {
                        0 => tracing::error!(plugin_msg = %msg),
                        1 => tracing::warn!(plugin_msg = %msg),
                        2 => tracing::info!(plugin_msg = %msg),
                        _ => tracing::debug!(plugin_msg = %msg),
                    }
                }
            },
        )
        .map_err(wrap_err)?;

    // host_set_result: guest writes its JSON result.
    linker
        .func_wrap(
            "plugbay",
            "host_set_result",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                if let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) {
                    caller.data_mut().output = bytes;
                }
            },
        )
        .map_err(wrap_err)?;

    // host_read_file: policy-gated read into a guest buffer.
    // Returns bytes copied, or -1 on I/O failure.  A denied path traps.
    linker
        .func_wrap(
            "plugbay",
            "host_read_file",
            |mut caller: Caller<'_, HostState>,
             path_ptr: i32,
             path_len: i32,
             dst_ptr: i32,
             dst_cap: i32|
             -> wasmtime::Result<i64> {
                let Some(path) = read_guest_string(&mut caller, path_ptr, path_len) else {
                    return Ok(-1);
                };
                let policy = Arc::clone(&caller.data().policy);
                let canonical = match policy.check_fs_access(&path) {
                    Ok(p) => p,
                    Err(violation) => {
                        caller.data_mut().violation = Some(violation);
                        return Err(wasmtime::Error::msg("permission violation"));
                    }
                };
                let Ok(bytes) = std::fs::read(&canonical) else {
                    return Ok(-1);
                };
                let copied = write_guest_bytes(&mut caller, dst_ptr, dst_cap, &bytes);
                Ok(copied as i64)
            },
        )
        .map_err(wrap_err)?;

    // host_write_file: policy-gated write from a guest buffer.
    linker
        .func_wrap(
            "plugbay",
            "host_write_file",
            |mut caller: Caller<'_, HostState>,
             path_ptr: i32,
             path_len: i32,
             src_ptr: i32,
             src_len: i32|
             -> wasmtime::Result<i32> {
                let Some(path) = read_guest_string(&mut caller, path_ptr, path_len) else {
                    return Ok(-1);
                };
                let policy = Arc::clone(&caller.data().policy);
                let canonical = match policy.check_fs_access(&path) {
                    Ok(p) => p,
                    Err(violation) => {
                        caller.data_mut().violation = Some(violation);
                        return Err(wasmtime::Error::msg("permission violation"));
                    }
                };
                let Some(bytes) = read_guest_bytes(&mut caller, src_ptr, src_len) else {
                    return Ok(-1);
                };
                match std::fs::write(&canonical, bytes) {
                    Ok(()) => Ok(0),
                    Err(_) => Ok(-1),
                }
            },
        )
        .map_err(wrap_err)?;

    // host_connect: policy gate for outbound connections.  The actual
    // connection is brokered by the host application; the sandbox only
    // decides whether the attempt may proceed at all.
    linker
        .func_wrap(
            "plugbay",
            "host_connect",
            |mut caller: Caller<'_, HostState>,
             host_ptr: i32,
             host_len: i32,
             _port: i32|
             -> wasmtime::Result<i32> {
                let Some(host) = read_guest_string(&mut caller, host_ptr, host_len) else {
                    return Ok(-1);
                };
                let policy = Arc::clone(&caller.data().policy);
                match policy.check_network(&host) {
                    Ok(()) => Ok(0),
                    Err(violation) => {
                        caller.data_mut().violation = Some(violation);
                        Err(wasmtime::Error::msg("permission violation"))
                    }
                }
            },
        )
        .map_err(wrap_err)?;

    // host_spawn: subprocess creation.  Denied for every context.
    linker
        .func_wrap(
            "plugbay",
            "host_spawn",
            |mut caller: Caller<'_, HostState>, _ptr: i32, _len: i32| -> wasmtime::Result<i32> {
                let policy = Arc::clone(&caller.data().policy);
                let violation = policy.check_spawn().unwrap_err();
                caller.data_mut().violation = Some(violation);
                Err(wasmtime::Error::msg("permission violation"))
            },
        )
        .map_err(wrap_err)?;

    // host_eval: dynamic code evaluation.  Denied for every context.
    linker
        .func_wrap(
            "plugbay",
            "host_eval",
            |mut caller: Caller<'_, HostState>, _ptr: i32, _len: i32| -> wasmtime::Result<i32> {
                let policy = Arc::clone(&caller.data().policy);
                let violation = policy.check_eval().unwrap_err();
                caller.data_mut().violation = Some(violation);
                Err(wasmtime::Error::msg("permission violation"))
            },
        )
        .map_err(wrap_err)?;

    // host_spawn_context: sub-context creation.  The cap is zero.
    linker
        .func_wrap(
            "plugbay",
            "host_spawn_context",
            |mut caller: Caller<'_, HostState>| -> wasmtime::Result<i32> {
                let policy = Arc::clone(&caller.data().policy);
                let violation = policy.check_subcontext(0).unwrap_err();
                caller.data_mut().violation = Some(violation);
                Err(wasmtime::Error::msg("permission violation"))
            },
        )
        .map_err(wrap_err)?;

    // host_now_ms: quantized wall clock.
    linker
        .func_wrap(
            "plugbay",
            "host_now_ms",
            |caller: Caller<'_, HostState>| -> i64 { caller.data().policy.guest_now_ms() as i64 },
        )
        .map_err(wrap_err)?;

    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(wasmtime::Extern::Memory(m)) => Some(m),
        _ => None,
    }
}

fn read_guest_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&caller);
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    if end > data.len() {
        return None;
    }
    Some(data[start..end].to_vec())
}

fn read_guest_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<String> {
    let bytes = read_guest_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).ok()
}

fn write_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    dst_ptr: i32,
    dst_cap: i32,
    bytes: &[u8],
) -> usize {
    let Some(memory) = guest_memory(caller) else {
        return 0;
    };
    let Ok(start) = usize::try_from(dst_ptr) else {
        return 0;
    };
    let cap = usize::try_from(dst_cap).unwrap_or(0);
    let count = bytes.len().min(cap);
    let data = memory.data_mut(caller);
    let Some(end) = start.checked_add(count) else {
        return 0;
    };
    if end > data.len() {
        return 0;
    }
    data[start..end].copy_from_slice(&bytes[..count]);
    count
}
