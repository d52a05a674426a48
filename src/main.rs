//! Fork-join demonstration of the weft runtime
//!
//! The root task spawns two producer tasks that each publish a data block,
//! plus a sink task gated on both output events; the sink reads the payloads
//! and shuts the runtime down.

use anyhow::Context;
use tracing::info;

use weft::{
    arg, args_count, AccessMode, DbFlags, Guid, Runtime, RuntimeConfig, TaskInput, TaskProps,
    TaskScope, NULL_GUID,
};

fn producer(scope: &TaskScope<'_>, params: &[u64], _inputs: &[TaskInput]) -> Guid {
    let value = params[0];
    let (db, mut access) = scope
        .db_create(8, DbFlags::default())
        .expect("producer block");
    access.write_u64(0, value);
    scope.db_release(db).expect("producer release");
    info!(value, "producer published");
    db
}

fn sink(scope: &TaskScope<'_>, _params: &[u64], inputs: &[TaskInput]) -> Guid {
    let a = inputs[0].data.as_ref().expect("payload a").read_u64(0);
    let b = inputs[1].data.as_ref().expect("payload b").read_u64(0);
    info!(a, b, sum = a + b, "sink joined");
    scope.shutdown(0);
    NULL_GUID
}

fn root(scope: &TaskScope<'_>, _params: &[u64], inputs: &[TaskInput]) -> Guid {
    info!(argc = args_count(&inputs[0]), argv0 = ?arg(&inputs[0], 0), "root task");

    let producer_tpl = scope.template_create(producer, 1, 1).expect("template");
    let sink_tpl = scope.template_create(sink, 0, 2).expect("template");

    let (task_a, out_a) = scope
        .task_create_with_output(producer_tpl, &[1], &[], TaskProps::default())
        .expect("task a");
    let (task_b, out_b) = scope
        .task_create_with_output(producer_tpl, &[2], &[], TaskProps::default())
        .expect("task b");
    let joiner = scope
        .task_create(sink_tpl, &[], &[], TaskProps::default())
        .expect("joiner");

    scope
        .add_dependence(out_a, joiner, 0, AccessMode::Const)
        .expect("dep a");
    scope
        .add_dependence(out_b, joiner, 1, AccessMode::Const)
        .expect("dep b");

    // Control edges start the producers
    scope
        .add_dependence(NULL_GUID, task_a, 0, AccessMode::default())
        .expect("start a");
    scope
        .add_dependence(NULL_GUID, task_b, 0, AccessMode::default())
        .expect("start b");
    NULL_GUID
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = RuntimeConfig::new()
        .with_workers(4)
        .context("worker count")?
        .with_args(std::env::args().collect());

    let exit_code = Runtime::run(config, root).context("runtime")?;
    std::process::exit(exit_code as i32);
}
