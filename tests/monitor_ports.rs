//! Port lifecycle tests against a real `Monitor`, with PTY pairs standing
//! in for serial devices. The device filter is pointed at the PTY so any
//! real hardware on the machine is left alone.

mod common;

use std::fs;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

use nix::pty::openpty;
use nix::unistd::ttyname;

use uart_monitor::identify::TtyPort;
use uart_monitor::monitor::{Monitor, MonitorOptions};
use uart_monitor::status::StatusReport;

use common::*;

fn sim_port() -> (OwnedFd, PathBuf) {
    let pty = openpty(None, None).expect("can allocate a PTY pair");
    let slave_path = ttyname(pty.slave.as_fd()).expect("slave has a path");
    (pty.master, slave_path)
}

fn identity_for(dev_path: &PathBuf, label: &str) -> TtyPort {
    let mut port = TtyPort {
        dev_path: dev_path.clone(),
        tty_name: dev_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string(),
        vid: 0x10c4,
        pid: 0xea71,
        interface: 0,
        serial: "TEST123".to_string(),
        manufacturer: "Test".to_string(),
        product: "Test UART".to_string(),
        usb_path: "1-1".to_string(),
        known: None,
        function: "Main UART",
        board_override: Some(label.to_string()),
        label: String::new(),
    };
    port.refresh_label();
    port
}

fn monitor_for(base: &std::path::Path, device: &PathBuf) -> Monitor {
    Monitor::new(MonitorOptions {
        base: base.to_path_buf(),
        only: Some(device.display().to_string()),
        ..MonitorOptions::default()
    })
    .unwrap()
}

fn read_status(base: &std::path::Path) -> StatusReport {
    let raw = fs::read_to_string(base.join("status.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn yield_then_reclaim_round_trip() {
    init();
    let base = scratch_base();
    let (_board, slave_path) = sim_port();

    let mut monitor = monitor_for(base.path(), &slave_path);

    let idx = monitor.add_port(identity_for(&slave_path, "Round Trip")).unwrap();

    let status = read_status(base.path());
    assert_eq!(status.port_count, 0); // written before our add

    monitor.write_status();
    let status = read_status(base.path());
    assert_eq!(status.port_count, 1);
    assert_eq!(status.ports[0].status.to_string(), "monitoring");

    let dev = slave_path.display().to_string();

    let response = monitor.yield_port(idx);
    assert_eq!(response, format!("OK yielded {dev}\n"));

    let response = monitor.yield_port(idx);
    assert_eq!(response, format!("OK already yielded {dev}\n"));

    let status = read_status(base.path());
    assert_eq!(status.ports[0].status.to_string(), "yielded");

    let response = monitor.reclaim_port(idx);
    assert_eq!(response, format!("OK reclaimed {dev}\n"));

    let response = monitor.reclaim_port(idx);
    assert_eq!(response, format!("OK already monitoring {dev}\n"));

    let status = read_status(base.path());
    assert_eq!(status.ports[0].status.to_string(), "monitoring");

    // The round trip leaves its two markers in the log.
    let log = fs::read_to_string(&status.ports[0].log_file).unwrap();
    assert!(log.contains("--- PORT YIELDED"));
    assert!(log.contains("--- PORT RECLAIMED"));

    monitor.shutdown();

    let log = fs::read_to_string(&status.ports[0].log_file).unwrap();
    assert!(log.contains("--- MONITOR STOPPED"));
    assert!(!base.path().join("status.json").exists());
}

#[test]
fn duplicate_device_paths_are_refused() {
    init();
    let base = scratch_base();
    let (_board, slave_path) = sim_port();

    let mut monitor = monitor_for(base.path(), &slave_path);

    monitor.add_port(identity_for(&slave_path, "First")).unwrap();
    let err = monitor
        .add_port(identity_for(&slave_path, "Second"))
        .unwrap_err();

    assert!(matches!(
        err,
        uart_monitor::error::Error::Duplicate { .. }
    ));

    monitor.shutdown();
}

#[test]
fn removal_compacts_the_port_table() {
    init();
    let base = scratch_base();
    let (_board_a, slave_a) = sim_port();
    let (_board_b, slave_b) = sim_port();

    let mut monitor = Monitor::new(MonitorOptions {
        base: base.path().to_path_buf(),
        only: Some(format!("{},{}", slave_a.display(), slave_b.display())),
        ..MonitorOptions::default()
    })
    .unwrap();

    monitor.add_port(identity_for(&slave_a, "Board A")).unwrap();
    monitor.add_port(identity_for(&slave_b, "Board B")).unwrap();

    monitor.write_status();
    assert_eq!(read_status(base.path()).port_count, 2);

    monitor.remove_port(0);
    monitor.write_status();

    let status = read_status(base.path());
    assert_eq!(status.port_count, 1);
    assert_eq!(status.ports[0].device, slave_b.display().to_string());

    // The log of the removed port records the disconnect.
    let session = base.path().join("latest");
    let log_a = fs::read_to_string(session.join("BOARD_A_UART0.log")).unwrap();
    assert!(log_a.contains("--- PORT DISCONNECTED"));

    monitor.shutdown();
}

#[test]
fn published_files_appear_and_disappear() {
    init();
    let base = scratch_base();
    let (_board, slave_path) = sim_port();

    let mut monitor = monitor_for(base.path(), &slave_path);

    assert!(base.path().join("uart-monitor.pid").is_file());
    assert!(base.path().join("uart-monitor.sock").exists());
    assert!(base.path().join("status.json").is_file());
    assert!(base.path().join("latest").join(".").exists());

    monitor.shutdown();
    assert!(!base.path().join("status.json").exists());
    assert!(!base.path().join("uart-monitor.sock").exists());

    drop(monitor);
    assert!(!base.path().join("uart-monitor.pid").exists());
}
