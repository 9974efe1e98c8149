use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use dora_engine::action::PartitionRouter;
use dora_engine::cancel;
use dora_engine::config::{self, Config};
use dora_engine::flusher::Flusher;
use dora_engine::log::init_log;
use dora_engine::session::Session;
use dora_engine::shell::{Shell, ShellOutcome};
use dora_engine::storage_manager::{MemStorageManager, StorageManager};

/// Process entry point: loads config, wires the partitioned runtime and
/// flusher around the in-memory reference storage manager, then drives the
/// shell's REPL off stdin until `QUIT` or EOF. Benchmark schemas and
/// transaction bodies are registered by whichever harness links this binary
/// in — none are built into the core itself (SPEC_FULL §1).
fn main() -> ExitCode {
    init_log();
    cancel::install_sigint_handler();

    let cfg = match Config::load_from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("starting with config: {:?}", cfg);
    let loops_before_sleep = cfg.queue_loops_before_sleep;
    let wake_threshold = cfg.queue_wake_threshold;
    let max_retries = cfg.max_retries;
    let loader_threads = cfg.loader_threads.max(1);
    config::install(cfg);

    let sm = Arc::new(MemStorageManager::new());
    let sm_dyn: Arc<dyn StorageManager> = sm.clone();

    let router = PartitionRouter::start(loader_threads, loops_before_sleep, wake_threshold);
    let flusher = Flusher::start(sm_dyn.clone(), loops_before_sleep, wake_threshold);
    let session = Session::new(sm_dyn, router.clone(), flusher.clone(), max_retries);

    let toggle_sm = sm.clone();
    let shell = Shell::new(session, router.clone(), flusher.clone(), Arc::new(move |on| toggle_sm.set_io_delay(on)));

    run_repl(&shell);

    router.stop_all();
    flusher.stop_and_join();
    ExitCode::SUCCESS
}

fn run_repl(shell: &Shell) {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("dora> ");
        if io::stdout().flush().is_err() {
            break;
        }
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                error!("error reading from stdin: {}", e);
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match shell.dispatch(trimmed) {
            Ok((text, ShellOutcome::Continue)) => {
                if !text.is_empty() {
                    println!("{}", text);
                }
            }
            Ok((text, ShellOutcome::Quit)) => {
                println!("{}", text);
                break;
            }
            Err(e) => println!("error: {}", e),
        }
    }
}
