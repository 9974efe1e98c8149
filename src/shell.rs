//! The interactive driver shell (SPEC_FULL §6.1): a line-oriented command
//! dispatcher for LOAD/WARMUP/TEST/MEASURE/TRXS/RESTART/INFO/STATS/DUMP/
//! IODELAY/SET/ENV/QUIT/HELP, matched case-insensitively.
//!
//! The shell itself never picks a schema or a transaction mix — `main`
//! registers tables and `ActionFactory`s for whichever benchmark (TPC-C,
//! TPC-B, TM1) it was built to drive, and the shell only dispatches against
//! that registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::info;

use crate::action::PartitionRouter;
use crate::cancel;
use crate::config::{self, Config};
use crate::error::{CoreError, CoreResult};
use crate::flusher::Flusher;
use crate::session::{ActionFactory, Session};
use crate::table::TableManager;

#[derive(Debug, PartialEq, Eq)]
pub enum ShellOutcome {
    Continue,
    Quit,
}

/// Owns the command registry and dispatches one line at a time. Output is
/// returned as a string rather than printed directly, so the same dispatch
/// logic serves an interactive REPL and a scripted test driver alike.
pub struct Shell {
    tables: Mutex<HashMap<String, Arc<TableManager>>>,
    trxs: Mutex<HashMap<String, Arc<dyn ActionFactory>>>,
    session: Session,
    router: Arc<PartitionRouter>,
    flusher: Arc<Flusher>,
    io_delay_toggle: Arc<dyn Fn(bool) + Send + Sync>,
    /// The shell's own working copy of the config, seeded from the
    /// process-wide one installed at startup. `SET` only ever edits this
    /// copy — the global `Config` is immutable once installed.
    effective_config: Mutex<Config>,
}

impl Shell {
    pub fn new(
        session: Session,
        router: Arc<PartitionRouter>,
        flusher: Arc<Flusher>,
        io_delay_toggle: Arc<dyn Fn(bool) + Send + Sync>,
    ) -> Shell {
        Shell {
            tables: Mutex::new(HashMap::new()),
            trxs: Mutex::new(HashMap::new()),
            session,
            router,
            flusher,
            io_delay_toggle,
            effective_config: Mutex::new(config::global().clone()),
        }
    }

    pub fn register_table(&self, name: impl Into<String>, table: Arc<TableManager>) {
        self.tables.lock().unwrap().insert(name.into(), table);
    }

    pub fn register_trx(&self, name: impl Into<String>, factory: Arc<dyn ActionFactory>) {
        self.trxs.lock().unwrap().insert(name.into(), factory);
    }

    /// Parses and runs one command line, returning the text the REPL should
    /// print and whether it should keep looping.
    pub fn dispatch(&self, line: &str) -> CoreResult<(String, ShellOutcome)> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok((String::new(), ShellOutcome::Continue));
        };
        let args = &tokens[1..];
        match cmd.to_ascii_uppercase().as_str() {
            "HELP" => Ok((Self::help_text(), ShellOutcome::Continue)),
            "QUIT" | "EXIT" => {
                cancel::request_cancel();
                Ok(("bye".to_string(), ShellOutcome::Quit))
            }
            "ENV" => Ok((self.env_text(), ShellOutcome::Continue)),
            "SET" => self.cmd_set(args),
            "INFO" => Ok((self.info_text(), ShellOutcome::Continue)),
            "TRXS" => Ok((self.trxs_text(), ShellOutcome::Continue)),
            "DUMP" => self.cmd_dump(args),
            "LOAD" => self.cmd_load(args),
            "WARMUP" => self.cmd_warmup(),
            "TEST" => self.cmd_test(args),
            "MEASURE" => self.cmd_measure(args),
            "IODELAY" => self.cmd_iodelay(args),
            "RESTART" => self.cmd_restart(),
            "" => Ok((String::new(), ShellOutcome::Continue)),
            other => Err(CoreError::DispatcherError(format!("unrecognized command: {}", other))),
        }
    }

    fn help_text() -> String {
        [
            "LOAD <table> <path>     bulk-load a table from a pipe-delimited file",
            "WARMUP                  verify every registered table's indexes",
            "TEST <trx> <count>      run <trx> <count> times sequentially, print results",
            "MEASURE <trx> <secs>    run <trx> back-to-back for <secs>, print throughput",
            "TRXS                    list registered transaction types",
            "RESTART                 bounce the worker pool and flusher",
            "INFO                    list registered tables",
            "STATS                   print per-transaction-type counters",
            "DUMP <table>            print every live row of <table>",
            "IODELAY on|off          toggle synthetic storage latency",
            "SET <key> <value>       override a config field for this run",
            "ENV                     print the active configuration",
            "QUIT                    exit the shell",
            "HELP                    print this text",
        ]
        .join("\n")
    }

    fn env_text(&self) -> String {
        format!("{:#?}", *self.effective_config.lock().unwrap())
    }

    fn cmd_set(&self, args: &[&str]) -> CoreResult<(String, ShellOutcome)> {
        let [key, value] = args else {
            return Err(CoreError::DispatcherError("usage: SET <key> <value>".to_string()));
        };
        self.effective_config.lock().unwrap().set(key, value)?;
        Ok((format!("{} = {}", key, value), ShellOutcome::Continue))
    }

    fn info_text(&self) -> String {
        let tables = self.tables.lock().unwrap();
        if tables.is_empty() {
            return "no tables registered".to_string();
        }
        let mut names: Vec<&String> = tables.keys().collect();
        names.sort();
        names
            .iter()
            .map(|n| format!("{} ({})", n, tables[*n].desc().column_summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn trxs_text(&self) -> String {
        let trxs = self.trxs.lock().unwrap();
        if trxs.is_empty() {
            return "no transaction types registered".to_string();
        }
        let mut names: Vec<&String> = trxs.keys().collect();
        names.sort();
        names.iter().map(|n| n.as_str()).collect::<Vec<_>>().join("\n")
    }

    fn cmd_dump(&self, args: &[&str]) -> CoreResult<(String, ShellOutcome)> {
        let [table_name] = args else {
            return Err(CoreError::DispatcherError("usage: DUMP <table>".to_string()));
        };
        let table = self.table(table_name)?;
        let rows = table
            .file_scan(0)
            .map_err(|e| CoreError::DispatcherError(format!("scan of {} failed: {}", table_name, e)))?;
        let mut out = format!("{} rows in {}\n", rows.len(), table_name);
        for item in &rows {
            match &item.row {
                Ok(row) => out.push_str(&format!("{:?}\n", row.values)),
                Err(e) => out.push_str(&format!("<unreadable: {}>\n", e)),
            }
        }
        Ok((out, ShellOutcome::Continue))
    }

    fn cmd_load(&self, args: &[&str]) -> CoreResult<(String, ShellOutcome)> {
        let [table_name, path] = args else {
            return Err(CoreError::DispatcherError("usage: LOAD <table> <path>".to_string()));
        };
        let table = self.table(table_name)?;
        let (group_size, line_limit) = {
            let cfg = self.effective_config.lock().unwrap();
            (cfg.bulk_load_group_size, cfg.bulk_load_line_limit)
        };
        let loaded = table.load_from_file(path, group_size, line_limit)?;
        Ok((format!("loaded {} rows into {}", loaded, table_name), ShellOutcome::Continue))
    }

    fn cmd_warmup(&self) -> CoreResult<(String, ShellOutcome)> {
        let tables = self.tables.lock().unwrap();
        let mut report = String::new();
        for (name, table) in tables.iter() {
            let ok = table.check_all_indexes()?;
            report.push_str(&format!("{}: {}\n", name, if ok { "OK" } else { "INCONSISTENT" }));
        }
        Ok((report, ShellOutcome::Continue))
    }

    fn cmd_test(&self, args: &[&str]) -> CoreResult<(String, ShellOutcome)> {
        let [trx_name, count] = args else {
            return Err(CoreError::DispatcherError("usage: TEST <trx> <count>".to_string()));
        };
        let count: u64 = count
            .parse()
            .map_err(|_| CoreError::DispatcherError(format!("not a count: {}", count)))?;
        let factory = self.trx(trx_name)?;
        cancel::reset();
        let mut committed = 0u64;
        let mut failed = 0u64;
        for _ in 0..count {
            if cancel::is_canceled() {
                info!("TEST {} canceled after {} attempts", trx_name, committed + failed);
                break;
            }
            match self.session.execute(factory.as_ref()) {
                Ok(()) => committed += 1,
                Err(e) => {
                    info!("TEST {} attempt failed: {}", trx_name, e);
                    failed += 1;
                }
            }
        }
        Ok((format!("{}: committed={} failed={}", trx_name, committed, failed), ShellOutcome::Continue))
    }

    fn cmd_measure(&self, args: &[&str]) -> CoreResult<(String, ShellOutcome)> {
        let [trx_name, secs] = args else {
            return Err(CoreError::DispatcherError("usage: MEASURE <trx> <secs>".to_string()));
        };
        let secs: u64 = secs
            .parse()
            .map_err(|_| CoreError::DispatcherError(format!("not a duration: {}", secs)))?;
        let factory = self.trx(trx_name)?;
        cancel::reset();
        let deadline = Instant::now() + Duration::from_secs(secs);
        let mut committed = 0u64;
        let mut failed = 0u64;
        while Instant::now() < deadline && !cancel::is_canceled() {
            match self.session.execute(factory.as_ref()) {
                Ok(()) => committed += 1,
                Err(_) => failed += 1,
            }
        }
        if cancel::is_canceled() {
            info!("MEASURE {} canceled early", trx_name);
        }
        let tps = committed as f64 / secs.max(1) as f64;
        Ok((format!("{}: committed={} failed={} tps={:.1}", trx_name, committed, failed, tps), ShellOutcome::Continue))
    }

    fn cmd_iodelay(&self, args: &[&str]) -> CoreResult<(String, ShellOutcome)> {
        let [setting] = args else {
            return Err(CoreError::DispatcherError("usage: IODELAY on|off".to_string()));
        };
        let on = match setting.to_ascii_lowercase().as_str() {
            "on" => true,
            "off" => false,
            _ => return Err(CoreError::DispatcherError(format!("expected on/off, got {}", setting))),
        };
        (self.io_delay_toggle)(on);
        Ok((format!("io delay {}", if on { "enabled" } else { "disabled" }), ShellOutcome::Continue))
    }

    /// Bounces the worker pool and flusher without touching committed data.
    /// `MemStorageManager` keeps no on-disk log to replay, so this is the
    /// full extent of "restart" the in-memory reference supports.
    fn cmd_restart(&self) -> CoreResult<(String, ShellOutcome)> {
        self.router.stop_all();
        self.flusher.stop_and_join();
        Ok(("worker pool and flusher stopped (restart a fresh process to resume serving)".to_string(), ShellOutcome::Continue))
    }

    fn table(&self, name: &str) -> CoreResult<Arc<TableManager>> {
        self.tables
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::DispatcherError(format!("no such table: {}", name)))
    }

    fn trx(&self, name: &str) -> CoreResult<Arc<dyn ActionFactory>> {
        self.trxs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::DispatcherError(format!("no such transaction type: {}", name)))
    }
}
