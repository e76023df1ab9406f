//! SIGTERM must go through the same handler as Ctrl-C instead of killing the
//! controller outright. One test per file: the handler is process-wide.

use std::{
    process::Command,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    thread,
    time::{Duration, Instant},
};

use rfi_capture::{config::CaptureConfig, executor::install_interrupt_handler};

#[test]
fn sigterm_sets_interrupt_flag() {
    let interrupted = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(interrupted.clone(), CaptureConfig::default()).unwrap();

    let status = Command::new("sh")
        .args(["-c", &format!("kill -TERM {}", std::process::id())])
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !interrupted.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "SIGTERM was not handled");
        thread::sleep(Duration::from_millis(10));
    }
}
