//! SPP devices driven through the dispatcher with real child processes.
//!
//! The device program logs its pid on start, so tests can count how often a
//! device was opened and check that replaced devices are really stopped.

#![cfg(target_os = "linux")]

use device_server::tracing_setup::LogControl;
use device_server::{ActionDispatcher, DeviceRegistry, DispatchError, DriverError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SCRIPT: &str = r###"echo $$ >> "$1"
printf '#SPP2\n#OK\n'
while read -r l; do
  case "$l" in
    fatal*) echo "#Fatal: lost power" ;;
    *) echo "$l"; echo "##escaped"; echo '#OK' ;;
  esac
done
"###;

struct Lab {
    dir: TempDir,
    dispatcher: ActionDispatcher,
}

impl Lab {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("box.sh"), SCRIPT).unwrap();
        let lab = Self {
            dir,
            dispatcher: ActionDispatcher::new(
                Arc::new(DeviceRegistry::new()),
                LogControl::detached(2),
            ),
        };
        let devices = lab.devices_file("box spp -prog \"sh {script} {log}\" -read_timeout 5\n");
        lab.dispatcher.registry().load_file(&devices).await.unwrap();
        lab
    }

    fn devices_file(&self, template: &str) -> PathBuf {
        let text = template
            .replace("{script}", &self.path("box.sh"))
            .replace("{log}", &self.path("pids.log"));
        let file = self.dir.path().join("devices.txt");
        std::fs::write(&file, text).unwrap();
        file
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn pids(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("pids.log"))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Live and not a zombie left for an absent reaper.
fn process_alive(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// SIGKILL is asynchronous, give the process a moment to go.
async fn process_stopped(pid: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_alive(pid) {
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}

#[tokio::test]
async fn test_program_started_once_for_many_connections() {
    let lab = Lab::new().await;
    let d = &lab.dispatcher;

    let (a, b) = tokio::join!(d.run("box/ask/one", 1), d.run("box/ask/two", 2));
    assert_eq!(a.unwrap(), "one\n#escaped");
    assert_eq!(b.unwrap(), "two\n#escaped");
    assert_eq!(lab.pids().len(), 1);

    d.conn_close(1).await;
    assert!(process_alive(&lab.pids()[0]));
    d.conn_close(2).await;
    assert!(process_stopped(&lab.pids()[0]).await);
}

#[tokio::test]
async fn test_fatal_error_restarts_program() {
    let lab = Lab::new().await;
    let d = &lab.dispatcher;

    d.run("box/ask/hello", 1).await.unwrap();
    let err = d.run("box/ask/fatal", 1).await.unwrap_err();
    assert!(matches!(err, DispatchError::Driver(DriverError::Fatal { .. })));
    assert_eq!(err.to_string(), "spp: lost power");
    let first = lab.pids()[0].clone();
    assert!(process_stopped(&first).await);

    assert_eq!(d.run("box/ask/again", 1).await.unwrap(), "again\n#escaped");
    assert_eq!(lab.pids().len(), 2);
    d.conn_close(1).await;
}

#[tokio::test]
async fn test_reload_stops_replaced_program() {
    let lab = Lab::new().await;
    let d = &lab.dispatcher;

    d.run("box/ask/hello", 1).await.unwrap();
    let pid = lab.pids()[0].clone();
    assert!(process_alive(&pid));

    let devices = lab.devices_file("box test\n");
    d.registry().load_file(&devices).await.unwrap();
    assert!(process_stopped(&pid).await);

    // the new device starts closed and opens on demand
    let new = d.registry().lookup("box").await.unwrap();
    assert!(!new.is_open());
    assert_eq!(d.run("box/ask/hello", 1).await.unwrap(), "hello");
}
