//! Policy domain: the operation layer tying the engines together
//!
//! Every API operation funnels through a [`PolicyDomain`]: it owns the
//! cross-object protocols (dependence registration, satisfaction delivery,
//! dispatch, finish-scope accounting, shutdown propagation) while the engine
//! modules own the per-object state machines. Co-located domains share one
//! handle registry and one scheduler; each has its own transport endpoint
//! for peer messaging.

use std::sync::Arc;

use parking_lot::{ Condvar, Mutex, RwLock };
use tracing::{ debug, trace, warn };

use crate::datablock::{
    AccessMode, AcquireOutcome, DataBlock, DbAccess, DbFlags, SubscribeOutcome,
};
use crate::error::{ Result, WeftError };
use crate::event::{ BindOutcome, Event, EventKind, EventParams, SatisfyOutcome, Subscriber };
use crate::guid::{ Guid, GuidKind, NULL_GUID };
use crate::registry::{ GuidRegistry, RuntimeObject };
use crate::task::{ SlotProgress, Task, TaskFn, TaskInput, TaskProps, TaskTemplate };
use crate::transport::{
    DomainEndpoint, Location, MessageBody, PolicyMessage, SendProps,
};
use crate::worker::{ self, Scheduler };

/// Why and how the runtime is coming down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownCause {
    /// Exit code supplied by the initiating task
    pub exit_code: i64,
    /// The request arrived over the transport rather than locally
    pub from_msg: bool,
}

/// One-shot shutdown latch shared by all domains of a runtime
pub struct ShutdownSignal {
    cause: Mutex<Option<ShutdownCause>>,
    cond: Condvar,
}

impl ShutdownSignal {
    /// Create an unsignalled latch
    pub fn new() -> Self {
        Self {
            cause: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Request shutdown; the first request wins
    pub fn request(&self, exit_code: i64, from_msg: bool) -> bool {
        let mut cause = self.cause.lock();
        if cause.is_some() {
            return false;
        }
        *cause = Some(ShutdownCause {
            exit_code,
            from_msg,
        });
        self.cond.notify_all();
        true
    }

    /// The recorded cause, if any
    pub fn peek(&self) -> Option<ShutdownCause> {
        *self.cause.lock()
    }

    /// Block until shutdown is requested
    pub fn wait(&self) -> ShutdownCause {
        let mut cause = self.cause.lock();
        while cause.is_none() {
            self.cond.wait(&mut cause);
        }
        cause.expect("signalled")
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every co-located domain of one runtime
pub struct DomainShared {
    /// The handle registry
    pub registry: GuidRegistry,
    /// The ready-task scheduler
    pub scheduler: Arc<Scheduler>,
    /// The shutdown latch
    pub shutdown: ShutdownSignal,
}

impl DomainShared {
    /// Create fresh shared state
    pub fn new() -> Self {
        Self {
            registry: GuidRegistry::new(),
            scheduler: Arc::new(Scheduler::new()),
            shutdown: ShutdownSignal::new(),
        }
    }
}

impl Default for DomainShared {
    fn default() -> Self {
        Self::new()
    }
}

/// A policy domain
pub struct PolicyDomain {
    location: Location,
    shared: Arc<DomainShared>,
    endpoint: RwLock<Option<Arc<DomainEndpoint>>>,
    peers: RwLock<Vec<Location>>,
}

impl PolicyDomain {
    /// Create a domain at `location` over the shared engines
    pub fn new(location: Location, shared: Arc<DomainShared>) -> Self {
        Self {
            location,
            shared,
            endpoint: RwLock::new(None),
            peers: RwLock::new(Vec::new()),
        }
    }

    /// This domain's location
    pub fn location(&self) -> Location {
        self.location
    }

    /// The shared engine state
    pub fn shared(&self) -> &Arc<DomainShared> {
        &self.shared
    }

    /// Attach the transport endpoint and peer set (network bring-up phase)
    pub fn attach_endpoint(&self, endpoint: Arc<DomainEndpoint>, peers: Vec<Location>) {
        *self.endpoint.write() = Some(endpoint);
        *self.peers.write() = peers;
    }

    /// Detach the transport endpoint (network tear-down phase)
    pub fn detach_endpoint(&self) {
        *self.endpoint.write() = None;
        self.peers.write().clear();
    }

    /// Open an API scope not bound to any executing task
    pub fn scope(&self) -> TaskScope<'_> {
        TaskScope {
            domain: self,
            current: NULL_GUID,
        }
    }

    // ---- data blocks ----

    /// Create a data block; the creator writes through the returned access
    /// until it releases the block
    pub fn db_create(&self, size: usize, flags: DbFlags) -> Result<(Guid, DbAccess)> {
        if flags.contains(DbFlags::PINNED.with(DbFlags::AUTO_DESTROY)) {
            // A pinned payload promises a stable address; auto-destroy
            // would pull it out from under the pin
            return Err(WeftError::invalid_call(
                "pinned blocks cannot auto-destroy",
            ));
        }
        let db = Arc::new(DataBlock::new(size, flags));
        let access = db.creator_access();
        let guid = self.shared.registry.issue(RuntimeObject::DataBlock(db))?;
        trace!(?guid, size, pinned = flags.contains(DbFlags::PINNED), "data block created");
        Ok((guid, access))
    }

    /// Publish the creator's writes: parked acquirers wake and deferred
    /// dependences deliver, all observing the released bytes
    pub fn db_release(&self, guid: Guid) -> Result<()> {
        let db = self.shared.registry.resolve_data_block(guid)?;
        let outcome = db.release_from_creator();
        for sub in outcome.subscribers {
            self.deliver(sub, guid);
        }
        self.post_release(guid, outcome.woken, outcome.destroy);
        Ok(())
    }

    /// Destroy a data block explicitly
    pub fn db_destroy(&self, guid: Guid) -> Result<()> {
        self.shared.registry.resolve_data_block(guid)?;
        self.shared.registry.retire(guid)?;
        trace!(?guid, "data block destroyed");
        Ok(())
    }

    fn post_release(&self, guid: Guid, woken: Vec<Guid>, destroy: bool) {
        for task in woken {
            self.shared.scheduler.enqueue(task);
        }
        if destroy {
            if self.shared.registry.retire(guid).is_ok() {
                trace!(?guid, "data block auto-destroyed");
            }
        }
    }

    // ---- events ----

    /// Create an event of `kind` with default parameters
    pub fn event_create(&self, kind: EventKind) -> Result<Guid> {
        if kind == EventKind::Counted {
            return Err(WeftError::invalid_call(
                "counted events need an expected-subscriber count",
            ));
        }
        self.event_create_params(kind, EventParams::default())
    }

    /// Create an event of `kind` with explicit parameters
    pub fn event_create_params(&self, kind: EventKind, params: EventParams) -> Result<Guid> {
        if kind == EventKind::Counted && params.expected_subscribers == 0 {
            return Err(WeftError::invalid_call(
                "counted events need a positive expected-subscriber count",
            ));
        }
        if kind == EventKind::Latch && params.initial_count < 0 {
            return Err(WeftError::invalid_call("latch count cannot start negative"));
        }
        let guid = self
            .shared
            .registry
            .issue(RuntimeObject::Event(Arc::new(Event::new(kind, params))))?;
        trace!(?guid, ?kind, "event created");
        Ok(guid)
    }

    /// Satisfy an event (slot 0)
    pub fn event_satisfy(&self, event: Guid, payload: Guid) -> Result<()> {
        self.event_satisfy_slot(event, payload, 0)
    }

    /// Satisfy an event on an explicit slot (latch increment/decrement)
    pub fn event_satisfy_slot(&self, event: Guid, payload: Guid, slot: u32) -> Result<()> {
        let evt = self.shared.registry.resolve_event(event)?;
        match evt.satisfy(event, payload, slot)? {
            SatisfyOutcome::Pending | SatisfyOutcome::Ignored => Ok(()),
            SatisfyOutcome::Fired {
                payload,
                subscribers,
                destroy,
            } => {
                if destroy {
                    let _ = self.shared.registry.retire(event);
                }
                for sub in subscribers {
                    self.deliver(sub, payload);
                }
                Ok(())
            }
        }
    }

    /// Destroy an event explicitly
    pub fn event_destroy(&self, event: Guid) -> Result<()> {
        self.shared.registry.resolve_event(event)?;
        self.shared.registry.retire(event)?;
        trace!(?event, "event destroyed");
        Ok(())
    }

    // ---- templates and tasks ----

    /// Declare a task template
    pub fn template_create(&self, func: TaskFn, paramc: usize, depc: usize) -> Result<Guid> {
        if paramc > crate::constants::MAX_TASK_PARAMS {
            return Err(WeftError::invalid_call("parameter count over the ceiling"));
        }
        if depc > crate::constants::MAX_TASK_DEPS {
            return Err(WeftError::invalid_call("dependence count over the ceiling"));
        }
        self.shared
            .registry
            .issue(RuntimeObject::Template(Arc::new(TaskTemplate::new(
                func, paramc, depc,
            ))))
    }

    /// Destroy a template; deferred while tasks created from it are live
    pub fn template_destroy(&self, template: Guid) -> Result<()> {
        let tpl = self.shared.registry.resolve_template(template)?;
        if tpl.request_destroy() {
            self.shared.registry.retire(template)?;
            trace!(?template, "template destroyed");
        } else {
            debug!(?template, "template destruction deferred to last live task");
        }
        Ok(())
    }

    /// Create a task from `template`
    ///
    /// `deps` supplies initial slot bindings: `UNINITIALIZED_GUID` leaves a
    /// slot for a later add-dependence, `NULL_GUID` satisfies it immediately
    /// as a control edge. `creator` attributes the task to a finish scope.
    pub fn task_create(
        &self,
        creator: Guid,
        template: Guid,
        params: &[u64],
        deps: &[Guid],
        props: TaskProps,
        want_output: bool,
    ) -> Result<(Guid, Guid)> {
        let tpl = self.shared.registry.resolve_template(template)?;
        if params.len() != tpl.paramc() {
            return Err(WeftError::invalid_call(format!(
                "template wants {} params, got {}",
                tpl.paramc(),
                params.len()
            )));
        }
        if !deps.is_empty() && deps.len() != tpl.depc() {
            return Err(WeftError::invalid_call(format!(
                "template wants {} deps, got {}",
                tpl.depc(),
                deps.len()
            )));
        }

        let output_event = if want_output {
            self.event_create(EventKind::Once)?
        } else {
            NULL_GUID
        };

        // The nearest finish ancestor: the creator itself when it opened a
        // scope, otherwise whatever scope the creator runs under
        let finish_scope = if creator.is_null() {
            NULL_GUID
        } else {
            let creator_task = self.shared.registry.resolve_task(creator)?;
            if creator_task.is_finish() {
                creator
            } else {
                creator_task.finish_scope()
            }
        };

        let is_finish = props.contains(TaskProps::FINISH);
        let task = Arc::new(Task::new(
            template,
            tpl.func(),
            params.to_vec().into_boxed_slice(),
            tpl.depc(),
            output_event,
            finish_scope,
            is_finish,
        ));
        let guid = self.shared.registry.issue(RuntimeObject::Task(task.clone()))?;
        tpl.register_task();
        if !finish_scope.is_null() {
            self.shared
                .registry
                .resolve_task(finish_scope)?
                .scope_enter();
        }
        trace!(?guid, ?template, depc = tpl.depc(), "task created");

        for (slot, dep) in deps.iter().enumerate() {
            if dep.is_uninitialized() {
                continue;
            }
            self.add_dependence(*dep, guid, slot as u32, AccessMode::default())?;
        }
        if tpl.depc() == 0 && task.ready_if_no_deps() {
            self.shared.scheduler.enqueue(guid);
        }
        Ok((guid, output_event))
    }

    /// Register the dependence `producer -> consumer[slot]` under `mode`
    pub fn add_dependence(
        &self,
        producer: Guid,
        consumer: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> Result<()> {
        if producer.is_uninitialized() {
            return Err(WeftError::invalid_call(
                "cannot bind an uninitialized producer",
            ));
        }
        let consumer_kind = self
            .shared
            .registry
            .kind_of(consumer)
            .ok_or_else(|| WeftError::unresolved(consumer, "consumer does not resolve"))?;
        let sub = Subscriber {
            consumer,
            slot,
            mode,
        };

        // Tasks record the binding in the slot; events only subscribe
        if consumer_kind == GuidKind::Task {
            self.shared
                .registry
                .resolve_task(consumer)?
                .bind_slot(slot, producer, mode)?;
        }

        if producer.is_null() || producer.is_error() {
            // Control edge (or propagated fault): satisfied on the spot
            self.deliver(sub, producer);
            return Ok(());
        }

        match self.shared.registry.resolve(producer)? {
            RuntimeObject::Event(evt) => match evt.bind(producer, sub)? {
                BindOutcome::Recorded => Ok(()),
                BindOutcome::Immediate { payload, destroy } => {
                    if destroy {
                        let _ = self.shared.registry.retire(producer);
                    }
                    self.deliver(sub, payload);
                    Ok(())
                }
            },
            RuntimeObject::DataBlock(db) => {
                // Released blocks are available producers; unreleased ones
                // hold the delivery until the creator publishes
                if db.subscribe(sub) == SubscribeOutcome::Ready {
                    self.deliver(sub, producer);
                }
                Ok(())
            }
            other => Err(WeftError::GuidKindMismatch {
                guid: producer,
                actual: other.kind().name(),
                expected: "event or data block",
            }),
        }
    }

    /// Deliver `payload` to one subscriber, translating per slot mode
    fn deliver(&self, sub: Subscriber, payload: Guid) {
        let payload = if sub.mode == AccessMode::Null {
            NULL_GUID
        } else {
            payload
        };
        match self.shared.registry.kind_of(sub.consumer) {
            Some(GuidKind::Task) => {
                let task = match self.shared.registry.resolve_task(sub.consumer) {
                    Ok(t) => t,
                    Err(_) => return,
                };
                match task.satisfy_slot(sub.slot, payload) {
                    Ok(SlotProgress::Ready) => self.shared.scheduler.enqueue(sub.consumer),
                    Ok(_) => {}
                    Err(e) => warn!(consumer = ?sub.consumer, slot = sub.slot, %e, "delivery rejected"),
                }
            }
            Some(GuidKind::Event) => {
                if let Err(e) = self.event_satisfy_slot(sub.consumer, payload, sub.slot) {
                    warn!(consumer = ?sub.consumer, %e, "transitive satisfaction failed");
                }
            }
            // Destroyed consumers drop satisfactions on the floor; the
            // destroy-vs-satisfy race resolves in destroy's favor
            _ => {}
        }
    }

    /// Destroy a task before it dispatches
    pub fn task_destroy(&self, guid: Guid) -> Result<()> {
        let task = self.shared.registry.resolve_task(guid)?;
        let bound = task.destroy_pre_dispatch(guid)?;
        for (producer, slot) in bound {
            if let Ok(evt) = self.shared.registry.resolve_event(producer) {
                evt.unbind(guid, slot);
            }
        }
        // Dependents learn of the cancellation through a null firing
        if !task.output_event().is_null() {
            let _ = self.event_satisfy(task.output_event(), NULL_GUID);
        }
        self.finish_scope_exit(&task);
        self.template_done(task.template());
        self.shared.registry.retire(guid)?;
        debug!(?guid, "task destroyed before dispatch");
        Ok(())
    }

    fn template_done(&self, template: Guid) {
        if let Ok(tpl) = self.shared.registry.resolve_template(template) {
            if tpl.task_done() {
                let _ = self.shared.registry.retire(template);
                trace!(?template, "deferred template destruction reclaimed");
            }
        }
    }

    // ---- dispatch glue ----

    /// Execute one ready task on the calling worker
    pub fn execute_ready(&self, guid: Guid) {
        let task = match self.shared.registry.resolve_task(guid) {
            Ok(t) => t,
            Err(_) => return,
        };

        // Resolve slot payloads in slot order, acquiring data blocks as we
        // go. An unreleased block or exclusive-write conflict parks the
        // task on the block; the release re-enqueues it and we back out
        // whole.
        let slots = task.snapshot_slots();
        let mut inputs = Vec::with_capacity(slots.len());
        // Acquired blocks keep their Arc for the whole dispatch so a
        // concurrent destroy cannot free storage under the running task
        let mut acquired: Vec<(Guid, Arc<DataBlock>)> = Vec::new();
        for dep in &slots {
            let payload = if dep.mode == AccessMode::Null {
                NULL_GUID
            } else {
                dep.payload
            };
            let mut input = TaskInput {
                handle: payload,
                mode: dep.mode,
                data: None,
            };
            if !payload.is_reserved() {
                if let Ok(RuntimeObject::DataBlock(db)) = self.shared.registry.resolve(payload) {
                    match db.acquire(guid, dep.mode) {
                        Ok(AcquireOutcome::Granted(access)) => {
                            acquired.push((payload, db));
                            input.data = Some(access);
                        }
                        Ok(AcquireOutcome::MustWait) => {
                            trace!(?guid, block = ?payload, "block unavailable, backing out");
                            self.release_acquired(guid, &acquired);
                            return;
                        }
                        Err(e) => {
                            warn!(?guid, block = ?payload, %e, "acquire failed");
                            self.release_acquired(guid, &acquired);
                            return;
                        }
                    }
                }
            }
            inputs.push(input);
        }

        if task.take_for_dispatch().is_err() {
            // Lost the claim; put the acquisitions back
            self.release_acquired(guid, &acquired);
            return;
        }
        trace!(?guid, "dispatching task");

        let scope = TaskScope {
            domain: self,
            current: guid,
        };
        let result =
            worker::with_current_task(guid, || (task.func())(&scope, task.params(), &inputs));

        self.release_acquired(guid, &acquired);
        self.route_return(&task, guid, result);

        self.template_done(task.template());
        if task.is_finish() {
            // The finish task holds its own scope open; closing it may
            // cascade into enclosing scopes
            if task.scope_exit() {
                self.close_finish_scope(guid, &task);
            }
        } else {
            self.finish_scope_exit(&task);
            let _ = self.shared.registry.retire(guid);
        }
    }

    fn release_acquired(&self, task: Guid, acquired: &[(Guid, Arc<DataBlock>)]) {
        for (db_guid, db) in acquired {
            match db.release(task) {
                Ok(outcome) => self.post_release(*db_guid, outcome.woken, outcome.destroy),
                // Released early by the task itself; nothing to do
                Err(_) => {}
            }
        }
    }

    fn route_return(&self, task: &Task, guid: Guid, result: Guid) {
        if task.is_finish() {
            // Published when the scope closes, not now
            task.set_finish_result(result);
            return;
        }
        let output = task.output_event();
        if output.is_null() {
            return;
        }
        self.publish_to_output(guid, output, result);
    }

    fn publish_to_output(&self, task: Guid, output: Guid, result: Guid) {
        // Returning an event chains it: the output fires when the returned
        // event fires
        if !result.is_reserved() {
            if let Ok(evt) = self.shared.registry.resolve_event(result) {
                let sub = Subscriber {
                    consumer: output,
                    slot: 0,
                    mode: AccessMode::default(),
                };
                match evt.bind(result, sub) {
                    Ok(BindOutcome::Recorded) => return,
                    Ok(BindOutcome::Immediate { payload, destroy }) => {
                        if destroy {
                            let _ = self.shared.registry.retire(result);
                        }
                        if let Err(e) = self.event_satisfy(output, payload) {
                            warn!(?task, %e, "output event publication failed");
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(?task, %e, "output chain failed");
                        return;
                    }
                }
            }
        }
        if let Err(e) = self.event_satisfy(output, result) {
            warn!(?task, %e, "output event publication failed");
        }
    }

    /// Decrement the enclosing finish scope after `task` finished or was
    /// destroyed
    fn finish_scope_exit(&self, task: &Task) {
        let mut scope = task.finish_scope();
        loop {
            if scope.is_null() {
                return;
            }
            let scope_task = match self.shared.registry.resolve_task(scope) {
                Ok(t) => t,
                Err(_) => return,
            };
            if !scope_task.scope_exit() {
                return;
            }
            let closed = scope;
            self.close_finish_scope_inner(closed, &scope_task);
            // The closed finish task itself completes inside its parent
            scope = scope_task.finish_scope();
        }
    }

    fn close_finish_scope(&self, guid: Guid, task: &Task) {
        self.close_finish_scope_inner(guid, task);
        self.finish_scope_exit(task);
    }

    fn close_finish_scope_inner(&self, guid: Guid, task: &Task) {
        debug!(?guid, "finish scope closed");
        let output = task.output_event();
        let result = task.finish_result();
        let _ = self.shared.registry.retire(guid);
        if !output.is_null() {
            self.publish_to_output(guid, output, result);
        }
    }

    // ---- shutdown and peer messaging ----

    /// Initiate runtime shutdown, propagating to peer domains first
    pub fn shutdown(&self, exit_code: i64) {
        let peers = self.peers.read().clone();
        let endpoint = self.endpoint.read().clone();
        if let Some(endpoint) = endpoint {
            for peer in peers {
                let msg = PolicyMessage::request(
                    self.location,
                    peer,
                    MessageBody::Shutdown { exit_code },
                );
                let backoff = crossbeam::utils::Backoff::new();
                loop {
                    match endpoint.send(msg.clone(), SendProps::PERSIST) {
                        Ok(()) => break,
                        Err(e) if e.is_transient() => backoff.snooze(),
                        Err(e) => {
                            warn!(peer, %e, "shutdown propagation failed");
                            break;
                        }
                    }
                }
            }
        }
        self.shared.shutdown.request(exit_code, false);
    }

    /// Handle one inbound peer message (called from the progress thread)
    pub fn handle_message(&self, msg: &PolicyMessage) {
        match &msg.body {
            MessageBody::Hello { location } => {
                debug!(from = location, at = self.location, "hello");
            }
            MessageBody::Shutdown { exit_code } => {
                debug!(at = self.location, exit_code, "shutdown from peer");
                self.shared.shutdown.request(*exit_code, true);
            }
            MessageBody::EventSatisfy {
                event,
                payload,
                slot,
            } => {
                if let Err(e) = self.event_satisfy_slot(*event, *payload, *slot) {
                    warn!(?event, %e, "remote satisfaction failed");
                }
            }
            MessageBody::GuidQuery { guid } => {
                let kind = self.shared.registry.kind_of(*guid).map(|k| k as u8);
                let resp =
                    PolicyMessage::response_to(msg, MessageBody::GuidInfo { guid: *guid, kind });
                let endpoint = self.endpoint.read().clone();
                if let Some(endpoint) = endpoint {
                    if let Err(e) = endpoint.send(resp, SendProps::default()) {
                        warn!(%e, "guid-info response failed");
                    }
                }
            }
            MessageBody::GuidInfo { guid, kind } => {
                debug!(?guid, ?kind, "guid info received");
            }
        }
    }
}

/// The API surface handed to user task functions (and to legacy code via
/// [`PolicyDomain::scope`])
pub struct TaskScope<'a> {
    domain: &'a PolicyDomain,
    current: Guid,
}

impl<'a> TaskScope<'a> {
    /// The executing task (`NULL_GUID` in a legacy scope)
    pub fn current_task(&self) -> Guid {
        self.current
    }

    /// Workers attached to the runtime's pool
    pub fn num_workers(&self) -> usize {
        self.domain.shared.scheduler.worker_count()
    }

    /// Create a data block
    pub fn db_create(&self, size: usize, flags: DbFlags) -> Result<(Guid, DbAccess)> {
        self.domain.db_create(size, flags)
    }

    /// Release a data block to other tasks
    pub fn db_release(&self, db: Guid) -> Result<()> {
        self.domain.db_release(db)
    }

    /// Destroy a data block
    pub fn db_destroy(&self, db: Guid) -> Result<()> {
        self.domain.db_destroy(db)
    }

    /// Create an event
    pub fn event_create(&self, kind: EventKind) -> Result<Guid> {
        self.domain.event_create(kind)
    }

    /// Create an event with explicit parameters
    pub fn event_create_params(&self, kind: EventKind, params: EventParams) -> Result<Guid> {
        self.domain.event_create_params(kind, params)
    }

    /// Satisfy an event
    pub fn event_satisfy(&self, event: Guid, payload: Guid) -> Result<()> {
        self.domain.event_satisfy(event, payload)
    }

    /// Satisfy an event on an explicit slot
    pub fn event_satisfy_slot(&self, event: Guid, payload: Guid, slot: u32) -> Result<()> {
        self.domain.event_satisfy_slot(event, payload, slot)
    }

    /// Destroy an event
    pub fn event_destroy(&self, event: Guid) -> Result<()> {
        self.domain.event_destroy(event)
    }

    /// Declare a task template
    pub fn template_create(&self, func: TaskFn, paramc: usize, depc: usize) -> Result<Guid> {
        self.domain.template_create(func, paramc, depc)
    }

    /// Destroy a task template
    pub fn template_destroy(&self, template: Guid) -> Result<()> {
        self.domain.template_destroy(template)
    }

    /// Create a task; dependences may be supplied now or bound later
    pub fn task_create(
        &self,
        template: Guid,
        params: &[u64],
        deps: &[Guid],
        props: TaskProps,
    ) -> Result<Guid> {
        self.domain
            .task_create(self.current, template, params, deps, props, false)
            .map(|(guid, _)| guid)
    }

    /// Create a task and reserve an output event for its return handle
    pub fn task_create_with_output(
        &self,
        template: Guid,
        params: &[u64],
        deps: &[Guid],
        props: TaskProps,
    ) -> Result<(Guid, Guid)> {
        self.domain
            .task_create(self.current, template, params, deps, props, true)
    }

    /// Register a dependence edge
    pub fn add_dependence(
        &self,
        producer: Guid,
        consumer: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> Result<()> {
        self.domain.add_dependence(producer, consumer, slot, mode)
    }

    /// Destroy a task that has not dispatched yet
    pub fn task_destroy(&self, task: Guid) -> Result<()> {
        self.domain.task_destroy(task)
    }

    /// Initiate clean shutdown of the runtime
    pub fn shutdown(&self, exit_code: i64) {
        self.domain.shutdown(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::UNINITIALIZED_GUID;

    fn domain() -> PolicyDomain {
        PolicyDomain::new(0, Arc::new(DomainShared::new()))
    }

    fn nop(_scope: &TaskScope<'_>, _params: &[u64], _inputs: &[TaskInput]) -> Guid {
        NULL_GUID
    }

    #[test]
    fn test_db_create_release_destroy() {
        let d = domain();
        let (guid, mut access) = d.db_create(16, DbFlags::default()).unwrap();
        access.write_u64(0, 7);
        d.db_release(guid).unwrap();
        d.db_destroy(guid).unwrap();
        assert!(d.db_destroy(guid).is_err());
    }

    #[test]
    fn test_pinned_auto_destroy_rejected() {
        let d = domain();
        assert!(d
            .db_create(8, DbFlags::PINNED.with(DbFlags::AUTO_DESTROY))
            .is_err());
        let (guid, _) = d.db_create(8, DbFlags::PINNED).unwrap();
        let db = d.shared.registry.resolve_data_block(guid).unwrap();
        assert!(db.is_pinned());
    }

    #[test]
    fn test_dependence_on_unreleased_block_defers() {
        let d = domain();
        let scope = d.scope();
        let (db, _access) = scope.db_create(8, DbFlags::default()).unwrap();

        let tpl = scope.template_create(nop, 0, 1).unwrap();
        let task = scope
            .task_create(tpl, &[], &[UNINITIALIZED_GUID], TaskProps::default())
            .unwrap();
        scope.add_dependence(db, task, 0, AccessMode::ReadOnly).unwrap();

        // The slot is bound but not satisfied until the creator releases
        let t = d.shared.registry.resolve_task(task).unwrap();
        assert_eq!(t.frontier(), 1);
        assert_eq!(d.shared.scheduler.pending(), 0);

        scope.db_release(db).unwrap();
        assert_eq!(t.frontier(), 0);
        assert_eq!(d.shared.scheduler.pending(), 1);
    }

    #[test]
    fn test_counted_event_requires_params() {
        let d = domain();
        assert!(d.event_create(EventKind::Counted).is_err());
        assert!(d
            .event_create_params(
                EventKind::Counted,
                EventParams {
                    expected_subscribers: 3,
                    ..Default::default()
                }
            )
            .is_ok());
    }

    #[test]
    fn test_once_event_retired_after_fire() {
        let d = domain();
        let evt = d.event_create(EventKind::Once).unwrap();
        d.event_satisfy(evt, NULL_GUID).unwrap();
        assert!(d.event_satisfy(evt, NULL_GUID).is_err());
    }

    #[test]
    fn test_task_create_binds_initial_deps() {
        let d = domain();
        let scope = d.scope();
        let tpl = scope.template_create(nop, 0, 2).unwrap();
        let evt = scope.event_create(EventKind::Sticky).unwrap();

        let task = scope
            .task_create(tpl, &[], &[evt, UNINITIALIZED_GUID], TaskProps::default())
            .unwrap();
        let t = d.shared.registry.resolve_task(task).unwrap();
        assert_eq!(t.frontier(), 2);

        // Slot 1 still unbound; slot 0 waits on the event
        scope.add_dependence(NULL_GUID, task, 1, AccessMode::Null).unwrap();
        assert_eq!(t.frontier(), 1);
        scope.event_satisfy(evt, NULL_GUID).unwrap();
        assert_eq!(t.frontier(), 0);
        assert_eq!(d.shared.scheduler.pending(), 1);
    }

    #[test]
    fn test_param_arity_checked() {
        let d = domain();
        let scope = d.scope();
        let tpl = scope.template_create(nop, 2, 0).unwrap();
        assert!(scope
            .task_create(tpl, &[1], &[], TaskProps::default())
            .is_err());
        assert!(scope
            .task_create(tpl, &[1, 2], &[], TaskProps::default())
            .is_ok());
    }

    #[test]
    fn test_zero_dep_task_enqueued_at_creation() {
        let d = domain();
        let scope = d.scope();
        let tpl = scope.template_create(nop, 0, 0).unwrap();
        scope.task_create(tpl, &[], &[], TaskProps::default()).unwrap();
        assert_eq!(d.shared.scheduler.pending(), 1);
    }

    #[test]
    fn test_task_destroy_fires_output_with_null() {
        let d = domain();
        let scope = d.scope();
        let tpl = scope.template_create(nop, 0, 1).unwrap();
        let (task, output) = scope
            .task_create_with_output(tpl, &[], &[], TaskProps::default())
            .unwrap();

        // A second task watches the first one's output
        let tpl2 = scope.template_create(nop, 0, 1).unwrap();
        let watcher = scope
            .task_create(tpl2, &[], &[output], TaskProps::default())
            .unwrap();

        scope.task_destroy(task).unwrap();
        let w = d.shared.registry.resolve_task(watcher).unwrap();
        assert_eq!(w.frontier(), 0);
        assert_eq!(w.snapshot_slots()[0].payload, NULL_GUID);
    }

    #[test]
    fn test_task_destroy_after_ready_rejected() {
        let d = domain();
        let scope = d.scope();
        let tpl = scope.template_create(nop, 0, 0).unwrap();
        let task = scope.task_create(tpl, &[], &[], TaskProps::default()).unwrap();
        assert!(matches!(
            scope.task_destroy(task),
            Err(WeftError::TaskAlreadyDispatched { .. })
        ));
    }

    #[test]
    fn test_template_destroy_deferred_until_task_done() {
        let d = domain();
        let scope = d.scope();
        let tpl = scope.template_create(nop, 0, 1).unwrap();
        let task = scope
            .task_create(tpl, &[], &[UNINITIALIZED_GUID], TaskProps::default())
            .unwrap();

        scope.template_destroy(tpl).unwrap();
        // Still resolvable: a live task references it
        assert!(d.shared.registry.resolve_template(tpl).is_ok());

        scope.add_dependence(NULL_GUID, task, 0, AccessMode::default()).unwrap();
        d.execute_ready(task);
        assert!(d.shared.registry.resolve_template(tpl).is_err());
    }

    #[test]
    fn test_execute_delivers_payloads_in_slot_order() {
        static SEEN: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        fn record(_scope: &TaskScope<'_>, _params: &[u64], inputs: &[TaskInput]) -> Guid {
            SEEN.lock()
                .extend(inputs.iter().map(|i| i.handle.as_raw()));
            NULL_GUID
        }

        let d = domain();
        let scope = d.scope();
        let tpl = scope.template_create(record, 0, 3).unwrap();
        let task = scope
            .task_create(
                tpl,
                &[],
                &[UNINITIALIZED_GUID, UNINITIALIZED_GUID, UNINITIALIZED_GUID],
                TaskProps::default(),
            )
            .unwrap();

        let evts: Vec<Guid> = (0..3)
            .map(|_| scope.event_create(EventKind::Sticky).unwrap())
            .collect();
        // Bind out of order
        scope.add_dependence(evts[2], task, 2, AccessMode::default()).unwrap();
        scope.add_dependence(evts[0], task, 0, AccessMode::default()).unwrap();
        scope.add_dependence(evts[1], task, 1, AccessMode::default()).unwrap();
        // Satisfy out of order with distinguishable payloads
        scope.event_satisfy(evts[1], Guid::from_raw(1001)).unwrap();
        scope.event_satisfy(evts[2], Guid::from_raw(1002)).unwrap();
        scope.event_satisfy(evts[0], Guid::from_raw(1000)).unwrap();

        let ready = d.shared.scheduler.next().unwrap();
        d.execute_ready(ready);
        assert_eq!(*SEEN.lock(), vec![1000, 1001, 1002]);
    }

    #[test]
    fn test_shutdown_signal_first_request_wins() {
        let d = domain();
        d.shutdown(3);
        d.shutdown(9);
        assert_eq!(
            d.shared.shutdown.peek(),
            Some(ShutdownCause {
                exit_code: 3,
                from_msg: false
            })
        );
    }
}
