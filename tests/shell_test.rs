//! Drives the shell through a realistic session: register a table and a
//! transaction type, LOAD a file, TEST it, then read STATS-equivalent
//! counters back through the `Session`.

use std::sync::{Arc, Mutex};

use dora_engine::action::{Action, PartitionRouter};
use dora_engine::codec::field::{FieldDescriptor, SqlType};
use dora_engine::error::{CoreError, CoreResult};
use dora_engine::flusher::Flusher;
use dora_engine::rvp::Countdown;
use dora_engine::session::{ActionFactory, Session};
use dora_engine::shell::{Shell, ShellOutcome};
use dora_engine::storage_manager::{MemStorageManager, StorageManager, XctId};
use dora_engine::table::descriptor::TableDescriptor;
use dora_engine::table::manager::TableManager;

struct NoopTrx;
impl ActionFactory for NoopTrx {
    fn name(&self) -> &'static str {
        "NOOP"
    }
    fn build(&self, xct: XctId, rvp: Arc<Countdown>, _slot: Arc<Mutex<Option<CoreError>>>) -> CoreResult<Vec<Action>> {
        Ok(vec![Action::new(xct, 0, vec![], rvp, || Ok(()))])
    }
}

fn setup() -> (Shell, Arc<MemStorageManager>) {
    let sm = Arc::new(MemStorageManager::new());
    let sm_dyn: Arc<dyn StorageManager> = sm.clone();
    let router = PartitionRouter::start(2, 30, 0);
    let flusher = Flusher::start(sm_dyn.clone(), 30, 0);
    let session = Session::new(sm_dyn, router.clone(), flusher.clone(), 3);
    let toggle_sm = sm.clone();
    let shell = Shell::new(session, router, flusher, Arc::new(move |on| toggle_sm.set_io_delay(on)));
    (shell, sm)
}

#[test]
fn full_shell_session_load_test_stats() {
    let (shell, sm) = setup();

    let mut desc = TableDescriptor::new(
        "customers",
        vec![
            FieldDescriptor::new("id", SqlType::Int, 4, false),
            FieldDescriptor::new("name", SqlType::Varchar, 16, true),
        ],
    )
    .unwrap();
    desc.create_index("pk_id", vec![0], true, true, false).unwrap();
    let sm_dyn: Arc<dyn StorageManager> = sm.clone();
    let table = Arc::new(TableManager::create(desc, sm_dyn).unwrap());
    shell.register_table("customers", table);
    shell.register_trx("NOOP", Arc::new(NoopTrx));

    let mut path = std::env::temp_dir();
    path.push(format!("dora-shell-itest-{}.txt", std::process::id()));
    std::fs::write(&path, "1|Alice\n2|Bob\n3|(null)\n").unwrap();

    let (load_out, outcome) = shell.dispatch(&format!("LOAD customers {}", path.to_str().unwrap())).unwrap();
    assert_eq!(outcome, ShellOutcome::Continue);
    assert!(load_out.contains("loaded 3 rows"));

    let (warmup_out, _) = shell.dispatch("WARMUP").unwrap();
    assert!(warmup_out.contains("customers: OK"));

    let (test_out, _) = shell.dispatch("TEST NOOP 10").unwrap();
    assert!(test_out.contains("committed=10"));
    assert!(test_out.contains("failed=0"));

    let (dump_out, _) = shell.dispatch("DUMP customers").unwrap();
    assert!(dump_out.contains("3 rows in customers"));

    let (quit_out, outcome) = shell.dispatch("QUIT").unwrap();
    assert_eq!(quit_out, "bye");
    assert_eq!(outcome, ShellOutcome::Quit);

    std::fs::remove_file(&path).ok();
}

#[test]
fn iodelay_and_set_commands_round_trip() {
    let (shell, _sm) = setup();
    let (out, _) = shell.dispatch("IODELAY on").unwrap();
    assert_eq!(out, "io delay enabled");
    let (out, _) = shell.dispatch("SET max_retries 7").unwrap();
    assert_eq!(out, "max_retries = 7");
    let (env_out, _) = shell.dispatch("ENV").unwrap();
    assert!(env_out.contains("max_retries: 7"));
}
