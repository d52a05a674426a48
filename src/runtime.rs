//! Runtime lifecycle: bring-up, the root task, and shutdown
//!
//! A [`Runtime`] owns the co-located policy domains, the transport fabric
//! between them, the worker pool, and the runlevel machine that walks those
//! subsystems through bring-up and tear-down. Process-wide state (registry,
//! workers) lives behind the runtime value, never in ambient globals, so
//! multiple runtimes can coexist in one process and teardown is testable.
//!
//! The user supplies a single root task function; the runtime marshals the
//! argument vector into a data block delivered on the root task's slot 0.
//! Execution ends when some task calls `shutdown`; the exit code travels
//! back through [`Runtime::shutdown`].

use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::utils::Backoff;
use parking_lot::{ Mutex, RwLock };
use tracing::{ debug, info, warn };

use crate::datablock::DbFlags;
use crate::domain::{ DomainShared, PolicyDomain, ShutdownCause, TaskScope };
use crate::error::{ Result, WeftError };
use crate::guid::Guid;
use crate::runlevel::{ PhaseAck, PhaseSchedule, RlProps, Runlevel, RunlevelMachine, Subsystem };
use crate::task::{ TaskFn, TaskInput, TaskProps };
use crate::transport::{
    DomainEndpoint, Location, MessageBody, PolicyMessage, SendProps, TransportConfig,
    TransportFabric,
};
use crate::worker::WorkerPool;

/// Top-level runtime configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads pulling ready tasks
    pub workers: usize,
    /// Co-located policy domains
    pub domains: usize,
    /// Inter-domain transport tuning
    pub transport: TransportConfig,
    /// Argument vector marshalled into the root task's data block
    pub args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            domains: 1,
            transport: TransportConfig::default(),
            args: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Start from defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(WeftError::config("worker count must be greater than 0"));
        }
        self.workers = workers;
        Ok(self)
    }

    /// Set the number of co-located policy domains
    pub fn with_domains(mut self, domains: usize) -> Result<Self> {
        if domains == 0 {
            return Err(WeftError::config("domain count must be greater than 0"));
        }
        self.domains = domains;
        Ok(self)
    }

    /// Set the transport configuration
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set the argument vector
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.domains == 0 {
            return Err(WeftError::config("workers and domains must be positive"));
        }
        Ok(())
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    shared: Arc<DomainShared>,
    domains: Vec<Arc<PolicyDomain>>,
    fabric: RwLock<Option<TransportFabric>>,
    pool: Mutex<Option<WorkerPool>>,
    comm_stop: Arc<AtomicBool>,
    comm_threads: Mutex<Vec<JoinHandle<()>>>,
    main_fn: TaskFn,
}

/// The tasking runtime
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    machine: RunlevelMachine,
}

impl Runtime {
    /// Bring the runtime up and inject the root task
    pub fn start(config: RuntimeConfig, main_fn: TaskFn) -> Result<Runtime> {
        config.validate()?;
        let shared = Arc::new(DomainShared::new());
        let domains: Vec<Arc<PolicyDomain>> = (0..config.domains)
            .map(|i| Arc::new(PolicyDomain::new(i as Location, Arc::clone(&shared))))
            .collect();

        let inner = Arc::new(RuntimeInner {
            config,
            shared,
            domains,
            fabric: RwLock::new(None),
            pool: Mutex::new(None),
            comm_stop: Arc::new(AtomicBool::new(false)),
            comm_threads: Mutex::new(Vec::new()),
            main_fn,
        });

        let machine = RunlevelMachine::new(vec![
            Arc::new(TransportSubsystem(Arc::clone(&inner))) as Arc<dyn Subsystem>,
            Arc::new(RegistrySubsystem(Arc::clone(&inner))),
            Arc::new(ComputeSubsystem(Arc::clone(&inner))),
            Arc::new(UserSubsystem(Arc::clone(&inner))),
        ]);
        machine.bring_up()?;
        info!(
            workers = inner.config.workers,
            domains = inner.config.domains,
            "runtime up"
        );
        Ok(Runtime { inner, machine })
    }

    /// Bring up, wait for shutdown, tear down; the common whole-program path
    pub fn run(config: RuntimeConfig, main_fn: TaskFn) -> Result<i64> {
        let runtime = Self::start(config, main_fn)?;
        runtime.shutdown()
    }

    /// Block until some task requests shutdown
    pub fn wait(&self) -> ShutdownCause {
        self.inner.shared.shutdown.wait()
    }

    /// Wait for the shutdown request, then walk teardown; returns the exit
    /// code
    pub fn shutdown(&self) -> Result<i64> {
        let cause = self.wait();
        let props = if cause.from_msg {
            RlProps::FROM_MSG
        } else {
            RlProps::default()
        };
        self.machine.tear_down(props)?;
        info!(exit_code = cause.exit_code, "runtime down");
        Ok(cause.exit_code)
    }

    /// An API scope not bound to any task, on the root domain
    pub fn scope(&self) -> TaskScope<'_> {
        self.inner.domains[0].scope()
    }

    /// The root policy domain
    pub fn root_domain(&self) -> &Arc<PolicyDomain> {
        &self.inner.domains[0]
    }

    /// Domain at `index`
    pub fn domain(&self, index: usize) -> Option<&Arc<PolicyDomain>> {
        self.inner.domains.get(index)
    }

    /// Number of workers in the pool
    pub fn num_workers(&self) -> usize {
        self.inner.config.workers
    }

    /// Park legacy (non-task) code until `event` is satisfied, returning its
    /// payload; workers keep running meanwhile
    pub fn legacy_block_progress(&self, event: Guid) -> Result<Guid> {
        let evt = self.inner.shared.registry.resolve_event(event)?;
        let backoff = Backoff::new();
        loop {
            if let Some(payload) = evt.payload() {
                return Ok(payload);
            }
            if self.inner.shared.shutdown.peek().is_some() {
                return Err(WeftError::invalid_call(
                    "runtime shut down while blocking on event",
                ));
            }
            backoff.snooze();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.machine.is_up() {
            self.inner.shared.shutdown.request(0, false);
            if let Err(e) = self.machine.tear_down(RlProps::default()) {
                warn!(%e, "teardown on drop failed");
            }
        }
    }
}

// ---- subsystems ----

struct TransportSubsystem(Arc<RuntimeInner>);

impl Subsystem for TransportSubsystem {
    fn name(&self) -> &str {
        "transport"
    }

    fn switch_runlevel(
        &self,
        schedule: &PhaseSchedule,
        rl: Runlevel,
        phase: u32,
        props: RlProps,
    ) -> Result<PhaseAck> {
        if props.contains(RlProps::RELEASE) {
            return Ok(PhaseAck::Complete);
        }
        let inner = &self.0;
        match rl {
            Runlevel::ConfigParse => {
                if props.contains(RlProps::BRING_UP) {
                    if schedule.is_first_phase_up(rl, phase) {
                        // Wiring and the hello handshake need separate
                        // barriers at the network runlevel
                        schedule.ensure_phase_up(Runlevel::NetworkOk, 2)?;
                    }
                    // The single config phase both requests and allocates
                    if schedule.is_last_phase_up(rl, phase) {
                        let locations: Vec<Location> =
                            (0..inner.config.domains as u64).collect();
                        let fabric = TransportFabric::new(&locations, &inner.config.transport)?;
                        *inner.fabric.write() = Some(fabric);
                        debug!(domains = locations.len(), "inbound queues allocated");
                    }
                } else if schedule.is_last_phase_down(rl, phase) {
                    *inner.fabric.write() = None;
                    debug!("transport fabric dropped");
                }
            }
            Runlevel::NetworkOk => {
                if props.contains(RlProps::BRING_UP) {
                    if schedule.is_first_phase_up(rl, phase) {
                        // Every neighbor's queues exist now; the barrier
                        // after config-parse guarantees it
                        let fabric = inner.fabric.read();
                        let fabric = fabric
                            .as_ref()
                            .ok_or_else(|| WeftError::runlevel("fabric missing at network-ok"))?;
                        fabric.wire();
                        for domain in &inner.domains {
                            let endpoint = fabric
                                .endpoint(domain.location())
                                .cloned()
                                .ok_or_else(|| WeftError::runlevel("endpoint missing"))?;
                            let peers: Vec<Location> = (0..inner.config.domains as u64)
                                .filter(|&l| l != domain.location())
                                .collect();
                            domain.attach_endpoint(endpoint, peers);
                        }
                    } else {
                        self.say_hello();
                    }
                } else if schedule.is_last_phase_down(rl, phase) {
                    for domain in &inner.domains {
                        domain.detach_endpoint();
                    }
                    if let Some(fabric) = inner.fabric.read().as_ref() {
                        fabric.unwire();
                    }
                }
            }
            _ => {}
        }
        Ok(PhaseAck::Complete)
    }
}

impl TransportSubsystem {
    fn say_hello(&self) {
        let inner = &self.0;
        let fabric = inner.fabric.read();
        let Some(fabric) = fabric.as_ref() else {
            return;
        };
        for endpoint in fabric.endpoints() {
            let from = endpoint.location();
            for peer in fabric.endpoints() {
                if peer.location() == from {
                    continue;
                }
                let msg = PolicyMessage::request(
                    from,
                    peer.location(),
                    MessageBody::Hello { location: from },
                );
                if let Err(e) = endpoint.send(msg, SendProps::default()) {
                    warn!(from, to = peer.location(), %e, "hello not delivered");
                }
            }
        }
    }
}

struct RegistrySubsystem(Arc<RuntimeInner>);

impl Subsystem for RegistrySubsystem {
    fn name(&self) -> &str {
        "registry"
    }

    fn switch_runlevel(
        &self,
        _schedule: &PhaseSchedule,
        rl: Runlevel,
        _phase: u32,
        props: RlProps,
    ) -> Result<PhaseAck> {
        if rl == Runlevel::GuidOk && !props.contains(RlProps::RELEASE) {
            if props.contains(RlProps::BRING_UP) {
                debug!("handle registry online");
            } else {
                let live = self.0.shared.registry.live_count();
                if live > 0 {
                    warn!(live, "handles still live at guid teardown");
                }
            }
        }
        Ok(PhaseAck::Complete)
    }
}

struct ComputeSubsystem(Arc<RuntimeInner>);

impl Subsystem for ComputeSubsystem {
    fn name(&self) -> &str {
        "compute"
    }

    fn switch_runlevel(
        &self,
        _schedule: &PhaseSchedule,
        rl: Runlevel,
        _phase: u32,
        props: RlProps,
    ) -> Result<PhaseAck> {
        if rl != Runlevel::ComputeOk || props.contains(RlProps::RELEASE) {
            return Ok(PhaseAck::Complete);
        }
        let inner = &self.0;
        if props.contains(RlProps::BRING_UP) {
            // Progress threads first so peer traffic drains while workers run
            if inner.config.domains > 1 {
                let fabric = inner.fabric.read();
                let fabric = fabric
                    .as_ref()
                    .ok_or_else(|| WeftError::runlevel("fabric missing at compute-ok"))?;
                let mut threads = inner.comm_threads.lock();
                for domain in &inner.domains {
                    let endpoint = fabric
                        .endpoint(domain.location())
                        .cloned()
                        .ok_or_else(|| WeftError::runlevel("endpoint missing"))?;
                    threads.push(spawn_comm_thread(
                        Arc::clone(domain),
                        endpoint,
                        Arc::clone(&inner.comm_stop),
                    ));
                }
            }
            let root = Arc::clone(&inner.domains[0]);
            let pool = WorkerPool::spawn(
                inner.config.workers,
                Arc::clone(&inner.shared.scheduler),
                move |task| root.execute_ready(task),
            );
            *inner.pool.lock() = Some(pool);
        } else {
            inner.shared.scheduler.stop();
            if let Some(pool) = inner.pool.lock().take() {
                pool.join();
            }
            inner.comm_stop.store(true, Ordering::Release);
            for handle in inner.comm_threads.lock().drain(..) {
                let _ = handle.join();
            }
        }
        Ok(PhaseAck::Complete)
    }
}

struct UserSubsystem(Arc<RuntimeInner>);

impl Subsystem for UserSubsystem {
    fn name(&self) -> &str {
        "user"
    }

    fn switch_runlevel(
        &self,
        _schedule: &PhaseSchedule,
        rl: Runlevel,
        _phase: u32,
        props: RlProps,
    ) -> Result<PhaseAck> {
        if rl == Runlevel::UserOk
            && props.contains(RlProps::BRING_UP)
            && !props.contains(RlProps::RELEASE)
        {
            let inner = &self.0;
            let scope = inner.domains[0].scope();
            let args_guid = marshal_args_block(&scope, &inner.config.args)?;
            let tpl = scope.template_create(inner.main_fn, 0, 1)?;
            scope.task_create(tpl, &[], &[args_guid], TaskProps::default())?;
            debug!("root task injected");
        }
        Ok(PhaseAck::Complete)
    }
}

fn spawn_comm_thread(
    domain: Arc<PolicyDomain>,
    endpoint: Arc<DomainEndpoint>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("weft-comm-{}", domain.location()))
        .spawn(move || {
            let backoff = Backoff::new();
            while !stop.load(Ordering::Acquire) {
                match endpoint.poll() {
                    Ok(Some(msg)) => {
                        domain.handle_message(&msg);
                        backoff.reset();
                    }
                    Ok(None) => backoff.snooze(),
                    Err(e) => {
                        warn!(at = domain.location(), %e, "poll failed");
                        backoff.snooze();
                    }
                }
            }
        })
        .expect("comm thread spawn")
}

// ---- root-task argument block ----

/// Build the argc/argv data block delivered to the root task
fn marshal_args_block(scope: &TaskScope<'_>, args: &[String]) -> Result<Guid> {
    let payload: usize = args.iter().map(|a| a.len()).sum();
    let size = 8 + 8 * args.len() + payload;
    let (guid, mut access) = scope.db_create(size, DbFlags::default())?;

    access.write_u64(0, args.len() as u64);
    let mut offset = 8 + 8 * args.len();
    for (i, arg) in args.iter().enumerate() {
        access.write_u64(1 + i, offset as u64);
        access.as_mut_slice()[offset..offset + arg.len()].copy_from_slice(arg.as_bytes());
        offset += arg.len();
    }
    scope.db_release(guid)?;
    Ok(guid)
}

/// Number of arguments in a root-task argument block
pub fn args_count(input: &TaskInput) -> usize {
    match &input.data {
        Some(data) if data.len() >= 8 => data.read_u64(0) as usize,
        _ => 0,
    }
}

/// The `i`-th argument in a root-task argument block
pub fn arg(input: &TaskInput, i: usize) -> Option<String> {
    let data = input.data.as_ref()?;
    let count = args_count(input);
    if i >= count {
        return None;
    }
    let start = data.read_u64(1 + i) as usize;
    let end = if i + 1 < count {
        data.read_u64(2 + i) as usize
    } else {
        data.len()
    };
    let bytes = data.as_slice().get(start..end)?;
    String::from_utf8(bytes.to_vec()).ok()
}
