//! Supervisor scenarios against a shell-script engine and an in-test monitor
//! server.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use acvm::config::{Architecture, ConfigStore, VmConfig};
use acvm::error::{LaunchError, SupervisorError};
use acvm::settings::{Settings, Timings};
use acvm::state_machine::lifecycle_sm::VmState;
use acvm::vm::launch::LaunchMode;
use acvm::vm::preview::screendump_path;
use acvm::vm::{OperationOutcome, StartOutcome, SupervisorEvent, SupervisorHandle};

const WAIT: Duration = Duration::from_secs(5);

/// Commands received by the fake monitor, in order.
type Received = Arc<Mutex<Vec<serde_json::Value>>>;

struct Harness {
    dir: tempfile::TempDir,
    store: ConfigStore,
    settings: Settings,
    received: Received,
}

impl Harness {
    /// `engine_body` runs after the arguments are recorded.
    async fn new(engine_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let engine = root.join("fake-engine");
        std::fs::write(
            &engine,
            format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\n{engine_body}\n",
                root.join("args").display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();

        let firmware = root.join("QEMU_EFI.fd");
        std::fs::write(&firmware, b"").unwrap();
        std::fs::write(root.join("disk.img"), b"").unwrap();
        std::fs::write(root.join("test.nvram"), b"").unwrap();

        let (port, received) = spawn_monitor_server().await;

        let settings = Settings {
            engine_path: Some(engine),
            firmware_path: firmware,
            monitor_port_min: port,
            monitor_port_max: port,
            timings: Timings {
                monitor_connect_delay: 50,
                powerdown_delay: 50,
                forced_cleanup_delay: 300,
                channel_release_delay: 10,
                preview_delay: 50,
                liveness_timeout: 2000,
                monitor_connect_attempts: 10,
                monitor_retry_backoff: 20,
            },
            ..Settings::default()
        };

        Self {
            store: ConfigStore::new(root.join("vms")),
            dir,
            settings,
            received,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self) -> VmConfig {
        let mut config = VmConfig::new(
            "test",
            Architecture::Aarch64,
            self.root().join("disk.img"),
            self.root().join("test.nvram"),
        );
        config.ram_megabytes = 2048;
        config
    }

    fn spawn(&self, config: VmConfig) -> (SupervisorHandle, broadcast::Receiver<SupervisorEvent>) {
        self.store.save(&config).unwrap();
        let handle = SupervisorHandle::spawn(config, self.settings.clone(), self.store.clone());
        let events = handle.subscribe();
        (handle, events)
    }

    fn recorded_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.root().join("args"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|command| command["execute"].as_str().map(str::to_string))
            .collect()
    }

    fn arguments_of(&self, command: &str) -> Option<serde_json::Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .find(|c| c["execute"] == command)
            .map(|c| c["arguments"].clone())
    }
}

/// Accepts monitor connections, greets, and acknowledges every command.
async fn spawn_monitor_server() -> (u16, Received) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received: Received = Arc::default();
    let log = Arc::clone(&received);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let greeting = b"{\r\n    \"QMP\": {\r\n        \"version\": {},\r\n        \"capabilities\": []\r\n    }\r\n}\r\n";
                if write.write_all(greeting).await.is_err() {
                    return;
                }
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let value: serde_json::Value = match serde_json::from_str(line.trim()) {
                        Ok(value) => value,
                        Err(_) => continue,
                    };
                    if value["execute"].is_string() {
                        log.lock().unwrap().push(value);
                    }
                    if write.write_all(b"{\r\n    \"return\": {}\r\n}\r\n").await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (port, received)
}

async fn next_state(events: &mut broadcast::Receiver<SupervisorEvent>) -> VmState {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::StateChanged(state)) => return state,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a state change")
}

async fn wait_for_monitor(handle: &SupervisorHandle) {
    tokio::time::timeout(WAIT, async {
        while !handle.status().await.unwrap().monitor_attached {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("monitor never attached");
}

/// Collect state changes until the stream is quiet for `quiet`.
async fn drain_states(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    quiet: Duration,
) -> Vec<VmState> {
    let mut states = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(quiet, events.recv()).await {
        if let SupervisorEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

#[tokio::test]
async fn full_session_pause_resume_stop() {
    let harness = Harness::new("exec sleep 30").await;
    let mut config = harness.config();
    config.cd_image = harness.root().join("missing.iso");
    config.mount_cd_image = true;
    let (handle, mut events) = harness.spawn(config);

    let outcome = handle.start(LaunchMode::Normal).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Started { pid: Some(_), .. }));
    assert_eq!(next_state(&mut events).await, VmState::Running);

    wait_for_monitor(&handle).await;

    assert_eq!(handle.pause().await.unwrap(), OperationOutcome::Done);
    assert_eq!(next_state(&mut events).await, VmState::Paused);

    assert_eq!(handle.resume().await.unwrap(), OperationOutcome::Done);
    assert_eq!(next_state(&mut events).await, VmState::Running);

    assert_eq!(handle.stop().await.unwrap(), OperationOutcome::Done);
    assert_eq!(next_state(&mut events).await, VmState::Stopped);

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, VmState::Stopped);
    assert_eq!(status.pid, None);
    assert!(!status.monitor_attached);

    let persisted = harness.store.load("test").unwrap();
    assert!(!persisted.mount_cd_image);

    let args = harness.recorded_args();
    assert!(args.windows(2).any(|w| w[0] == "-m" && w[1] == "2048M"));
    assert!(args.windows(2).any(|w| w[0] == "-nic" && w[1] == "user,model=virtio"));
    assert!(!args.iter().any(|a| a.contains("cdimage")));

    assert_eq!(
        harness.received(),
        ["qmp_capabilities", "stop", "cont", "system_powerdown"]
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_from_paused_resumes_before_powerdown() {
    let harness = Harness::new("exec sleep 30").await;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Headless).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);
    wait_for_monitor(&handle).await;

    handle.pause().await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Paused);

    handle.stop().await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Stopped);

    let received = harness.received();
    let tail: Vec<&str> = received.iter().rev().take(2).rev().map(String::as_str).collect();
    assert_eq!(tail, ["cont", "system_powerdown"]);

    let args = harness.recorded_args();
    assert!(args.windows(2).any(|w| w[0] == "-serial" && w[1] == "stdio"));
}

#[tokio::test]
async fn process_exiting_on_its_own_is_cleaned_up() {
    let harness = Harness::new("sleep 0.3").await;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);
    assert_eq!(next_state(&mut events).await, VmState::Stopped);

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, VmState::Stopped);
    assert_eq!(status.pid, None);
}

#[tokio::test]
async fn start_with_live_process_only_stops_it() {
    let harness = Harness::new("exec sleep 30").await;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);

    let second = handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(second, StartOutcome::StoppedExisting);
    assert_eq!(next_state(&mut events).await, VmState::Stopped);
    assert_eq!(handle.status().await.unwrap().pid, None);
}

#[tokio::test]
async fn disabled_operation_is_ignored_and_resyncs_observers() {
    let harness = Harness::new("exec sleep 30").await;
    let (handle, mut events) = harness.spawn(harness.config());

    assert_eq!(handle.pause().await.unwrap(), OperationOutcome::Ignored);
    assert_eq!(next_state(&mut events).await, VmState::Stopped);
    assert_eq!(handle.resume().await.unwrap(), OperationOutcome::Ignored);
    assert_eq!(handle.stop().await.unwrap(), OperationOutcome::Ignored);
    assert!(harness.received().is_empty());
}

#[tokio::test]
async fn repeated_cleanup_notifies_once() {
    let harness = Harness::new("exec sleep 30").await;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);

    assert_eq!(handle.terminate().await.unwrap(), OperationOutcome::Done);
    assert_eq!(handle.terminate().await.unwrap(), OperationOutcome::Ignored);

    let states = drain_states(&mut events, Duration::from_millis(400)).await;
    assert_eq!(states, [VmState::Stopped]);
}

#[tokio::test]
async fn pause_without_monitor_fails_without_state_change() {
    let mut harness = Harness::new("exec sleep 30").await;
    // Monitor attach is pushed past the end of the test.
    harness.settings.timings.monitor_connect_delay = 10_000;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);

    let err = handle.pause().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Monitor(_)));
    assert_eq!(handle.status().await.unwrap().state, VmState::Running);

    handle.terminate().await.unwrap();
}

#[tokio::test]
async fn missing_main_image_reports_launch_error() {
    let harness = Harness::new("exec sleep 30").await;
    let mut config = harness.config();
    config.main_image = harness.root().join("nope.img");
    let (handle, _events) = harness.spawn(config);

    let err = handle.start(LaunchMode::Normal).await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Launch(LaunchError::MissingMainImage(_))
    ));
    assert_eq!(handle.status().await.unwrap().state, VmState::Stopped);
    assert!(!harness.root().join("args").exists());
}

#[tokio::test]
async fn spawn_failure_leaves_state_stopped() {
    let mut harness = Harness::new("exec sleep 30").await;
    let not_executable: PathBuf = harness.root().join("not-executable");
    std::fs::write(&not_executable, b"").unwrap();
    std::fs::set_permissions(&not_executable, std::fs::Permissions::from_mode(0o644)).unwrap();
    harness.settings.engine_path = Some(not_executable);
    let (handle, mut events) = harness.spawn(harness.config());

    let err = handle.start(LaunchMode::Normal).await.unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailure(_)));
    assert_eq!(next_state(&mut events).await, VmState::Stopped);
}

#[tokio::test]
async fn replace_config_is_locked_to_the_running_vm() {
    let harness = Harness::new("exec sleep 30").await;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);

    let mut other = harness.config();
    other.name = "other".into();
    let err = handle.replace_config(other.clone()).await.unwrap_err();
    assert!(matches!(err, SupervisorError::ConfigLocked { .. }));

    handle.terminate().await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Stopped);

    assert_eq!(handle.replace_config(other).await.unwrap(), OperationOutcome::Done);
    assert_eq!(handle.status().await.unwrap().vm_name, "other");
}

#[tokio::test]
async fn delete_removes_record_and_nvram() {
    let harness = Harness::new("exec sleep 30").await;
    let config = harness.config();
    let nvram = config.nvram.clone();
    let (handle, mut events) = harness.spawn(config);

    handle.delete().await.unwrap();

    let deleted = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SupervisorEvent::ConfigurationDeleted(name)) = events.recv().await {
                return name;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(deleted, "test");
    assert!(!harness.store.path_for("test").exists());
    assert!(!nvram.exists());
}

#[tokio::test]
async fn stop_from_paused_sends_powerdown_before_forced_cleanup() {
    let mut harness = Harness::new("exec sleep 30").await;
    harness.settings.timings.powerdown_delay = 250;
    harness.settings.timings.forced_cleanup_delay = 50;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);
    wait_for_monitor(&handle).await;
    handle.pause().await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Paused);

    handle.stop().await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Stopped);
    assert_eq!(
        harness.received(),
        ["qmp_capabilities", "stop", "cont", "system_powerdown"]
    );
}

#[tokio::test]
async fn record_changed_during_session_survives_cleanup() {
    let harness = Harness::new("exec sleep 30").await;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);

    let mut edited = harness.config();
    edited.cores = 8;
    edited.cd_image = harness.root().join("installer.iso");
    edited.mount_cd_image = true;
    harness.store.save(&edited).unwrap();
    assert_eq!(
        handle.replace_config(edited).await.unwrap(),
        OperationOutcome::Deferred
    );

    handle.terminate().await.unwrap();
    let replaced = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                SupervisorEvent::ConfigurationReplaced(config) => break config,
                SupervisorEvent::StateChanged(VmState::Stopped) => panic!("stopped without the new record"),
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(replaced.cores, 8);
    assert_eq!(next_state(&mut events).await, VmState::Stopped);

    let saved = harness.store.load("test").unwrap();
    assert_eq!(saved.cores, 8);
    assert!(!saved.mount_cd_image);
}

#[tokio::test]
async fn reselecting_running_vm_refreshes_preview() {
    let harness = Harness::new("exec sleep 30").await;
    let image = harness.root().join("preview disk.img");
    std::fs::write(&image, b"").unwrap();
    let mut config = harness.config();
    config.main_image = image.clone();

    let shot = screendump_path(&image);
    assert!(shot.ends_with("preview_disk.img_screen.ppm"));
    let mut ppm = b"P6\n# test\n4 3\n255\n".to_vec();
    ppm.extend_from_slice(&[0u8; 36]);
    std::fs::write(&shot, ppm).unwrap();

    let (handle, mut events) = harness.spawn(config.clone());
    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);
    wait_for_monitor(&handle).await;

    handle.replace_config(config).await.unwrap();

    let preview = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SupervisorEvent::PreviewReady(image)) = events.recv().await {
                return image;
            }
        }
    })
    .await
    .expect("no preview after re-selecting the VM");
    assert_eq!((preview.width, preview.height), (4, 3));
    assert_eq!(preview.path, shot);

    let arguments = harness.arguments_of("screendump").expect("screendump was not sent");
    assert_eq!(arguments["filename"], shot.display().to_string());

    handle.terminate().await.unwrap();
    let _ = std::fs::remove_file(&shot);
}

#[tokio::test]
async fn failed_delete_still_reports_stopped() {
    let harness = Harness::new("exec sleep 30").await;
    let (handle, mut events) = harness.spawn(harness.config());

    handle.start(LaunchMode::Normal).await.unwrap();
    assert_eq!(next_state(&mut events).await, VmState::Running);

    // A directory where the record should be makes both save and delete fail.
    let record = harness.store.path_for("test");
    std::fs::remove_file(&record).unwrap();
    std::fs::create_dir(&record).unwrap();

    let err = handle.delete().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Store(_)));
    assert_eq!(next_state(&mut events).await, VmState::Stopped);

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, VmState::Stopped);
    assert_eq!(status.pid, None);
}
