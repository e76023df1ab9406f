//! Background readers for the capture executables' output.
//!
//! The receiver prints a `STAT` report for every slot it hands to the ring
//! buffer. [`StreamMonitor`] follows those reports and warns when slots arrive
//! short of packets. [`LogRelay`] forwards the spectrometer's own log lines so
//! its pipe never fills up.
//!
//! Both run on their own thread for as long as the stream is open. Stopping is
//! synchronous: the caller blocks until the thread has exited, which happens
//! once the stream reaches EOF, so close the writer (terminate the process)
//! first.

use std::{
    collections::VecDeque,
    io::{BufRead, BufReader, Read},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, trace, warn};

pub const STAT_MARKER: &str = "STAT";

/// Slot accounting from one receiver status report
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LossReport {
    pub total_slots: u64,
    pub filled_slots: u64,
}

impl LossReport {
    /// Fraction of slots that were not completely filled, in `[0, 1)`
    pub fn loss_fraction(&self) -> f64 {
        if self.total_slots == 0 {
            return 0.0;
        }
        1.0 - self.filled_slots as f64 / self.total_slots as f64
    }

    pub fn is_lossy(&self) -> bool {
        self.filled_slots < self.total_slots
    }
}

/// `STAT <total> <x> <filled> ...`
pub fn parse_stat_line(line: &str) -> Option<LossReport> {
    let mut fields = line.split_whitespace();
    if fields.next()? != STAT_MARKER {
        return None;
    }
    let total_slots = fields.next()?.parse().ok()?;
    let filled_slots = fields.nth(1)?.parse().ok()?;
    Some(LossReport {
        total_slots,
        filled_slots,
    })
}

/// Skips the warm-up reports, then parses the rest
#[derive(Debug)]
pub struct StatParser {
    remaining_skip: u32,
}

impl StatParser {
    pub fn new(skip_count: u32) -> Self {
        Self {
            remaining_skip: skip_count,
        }
    }

    pub fn feed(&mut self, line: &str) -> Option<LossReport> {
        if line.split_whitespace().next() != Some(STAT_MARKER) {
            return None;
        }
        if self.remaining_skip > 0 {
            self.remaining_skip -= 1;
            return None;
        }
        parse_stat_line(line)
    }
}

/// What a reader thread does with each line, and what it hands back at the end
pub trait LineHandler: Send + 'static {
    type Output: Send + 'static;

    fn on_line(&mut self, line: &str);
    fn finish(self) -> Self::Output;
}

struct LineWorker<T> {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> LineWorker<T> {
    fn spawn<R, H>(name: &str, stream: R, mut handler: H) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
        H: LineHandler<Output = T>,
    {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut reader = BufReader::new(stream);
                // Raw bytes, so a stray non-UTF-8 byte can't end the loop and
                // close the pipe under the writer
                let mut line = Vec::new();
                loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => handler.on_line(String::from_utf8_lossy(&line).trim_end()),
                        Err(e) => {
                            debug!("Stopped reading stream: {}", e);
                            break;
                        }
                    }
                }
                handler.finish()
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Wait for the stream to end on its own, without signalling the thread
    fn join(&mut self) -> Option<T> {
        let handle = self.handle.take()?;
        let result = handle.join();
        self.stop.take();
        result.map_err(|_| error!("Stream reader thread panicked")).ok()
    }

    /// Signal the thread and join it. `None` once already stopped.
    fn stop(&mut self) -> Option<T> {
        if let Some(stop) = self.stop.take() {
            // Full or disconnected both mean the thread will see it
            let _ = stop.try_send(());
        }
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(v) => Some(v),
            Err(_) => {
                error!("Stream reader thread panicked");
                None
            }
        }
    }
}

struct LossTracker {
    parser: StatParser,
    lossy: Vec<LossReport>,
}

impl LineHandler for LossTracker {
    type Output = Vec<LossReport>;

    fn on_line(&mut self, line: &str) {
        trace!("{}", line);
        if let Some(report) = self.parser.feed(line) {
            if report.is_lossy() {
                warn!(
                    "Packet loss detected in network capture ({:.6}% loss) consider repeating this measurement",
                    100.0 * report.loss_fraction()
                );
                self.lossy.push(report);
            }
        }
    }

    fn finish(self) -> Vec<LossReport> {
        self.lossy
    }
}

/// Watches the receiver's status output for packet loss
pub struct StreamMonitor {
    worker: LineWorker<Vec<LossReport>>,
}

impl StreamMonitor {
    pub fn attach<R: Read + Send + 'static>(stream: R, skip_count: u32) -> std::io::Result<Self> {
        let tracker = LossTracker {
            parser: StatParser::new(skip_count),
            lossy: Vec::new(),
        };
        Ok(Self {
            worker: LineWorker::spawn("stream-monitor", stream, tracker)?,
        })
    }

    /// Block until the monitor thread has exited and return the lossy reports it
    /// saw. Later calls return nothing.
    pub fn stop(&mut self) -> Vec<LossReport> {
        self.worker.stop().unwrap_or_default()
    }

    /// Like [`StreamMonitor::stop`], but reads every remaining line first
    pub fn join(&mut self) -> Vec<LossReport> {
        self.worker.join().unwrap_or_default()
    }
}

impl Drop for StreamMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Lines of spectrometer output kept for error reports
pub const RELAY_TAIL_LINES: usize = 20;

struct Relay {
    source: String,
    tail: VecDeque<String>,
}

impl LineHandler for Relay {
    type Output = Vec<String>;

    fn on_line(&mut self, line: &str) {
        relay_line(&self.source, line);
        if self.tail.len() == RELAY_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_owned());
    }

    fn finish(self) -> Vec<String> {
        self.tail.into()
    }
}

/// Forwards the spectrometer's log lines into ours
pub struct LogRelay {
    worker: LineWorker<Vec<String>>,
}

impl LogRelay {
    pub fn attach<R: Read + Send + 'static>(source: &str, stream: R) -> std::io::Result<Self> {
        let relay = Relay {
            source: source.to_owned(),
            tail: VecDeque::with_capacity(RELAY_TAIL_LINES),
        };
        Ok(Self {
            worker: LineWorker::spawn("log-relay", stream, relay)?,
        })
    }

    /// Join the relay thread and return the last lines it forwarded.
    /// Later calls return nothing.
    pub fn stop(&mut self) -> Vec<String> {
        self.worker.stop().unwrap_or_default()
    }

    /// Like [`LogRelay::stop`], but reads every remaining line first
    pub fn join(&mut self) -> Vec<String> {
        self.worker.join().unwrap_or_default()
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn relay_line(source: &str, line: &str) {
    if line.contains("[error]") {
        error!("{}: {}", source, line);
    } else if line.contains("[warning]") {
        warn!("{}: {}", source, line);
    } else if line.contains("[info]") {
        info!("{}: {}", source, line);
    } else {
        debug!("{}: {}", source, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_stat_line() {
        let report = parse_stat_line("STAT 100 0 90 10 2 0").unwrap();
        assert_eq!(
            report,
            LossReport {
                total_slots: 100,
                filled_slots: 90
            }
        );
        assert!((report.loss_fraction() - 0.1).abs() < 1e-12);
        assert!(parse_stat_line("HEAP 100 0 90").is_none());
        assert!(parse_stat_line("STAT 100").is_none());
    }

    #[test]
    fn test_full_slots_are_not_lossy() {
        let report = parse_stat_line("STAT 100 0 100 0").unwrap();
        assert!(!report.is_lossy());
        assert_eq!(report.loss_fraction(), 0.0);
    }

    #[test]
    fn test_skip_warm_up() {
        let mut parser = StatParser::new(2);
        assert!(parser.feed("STAT 100 0 10").is_none());
        assert!(parser.feed("some chatter").is_none());
        assert!(parser.feed("STAT 100 0 10").is_none());
        assert!(parser.feed("STAT 100 0 10").is_some());
    }

    #[test]
    fn test_monitor_reports_loss() {
        let output = "STAT 100 0 1 0\n\
                      STAT 100 0 100 0\n\
                      STAT 100 0 100 0\n\
                      STAT 100 0 90 10\n\
                      done\n";
        let mut monitor = StreamMonitor::attach(Cursor::new(output), 1).unwrap();
        let lossy = monitor.join();
        assert_eq!(
            lossy,
            vec![LossReport {
                total_slots: 100,
                filled_slots: 90
            }]
        );
        // Idempotent
        assert!(monitor.stop().is_empty());
    }

    #[test]
    fn test_monitor_silent_during_warm_up() {
        let output = "STAT 100 0 0 0\nSTAT 100 0 50 0\nSTAT 100 0 100 0\n";
        let mut monitor = StreamMonitor::attach(Cursor::new(output), 2).unwrap();
        assert!(monitor.join().is_empty());
        assert!(monitor.stop().is_empty());
    }

    #[test]
    fn test_skip_ignores_other_stat_words() {
        let mut parser = StatParser::new(1);
        assert!(parser.feed("STATUS heaps=12").is_none());
        assert!(parser.feed("STATISTICS follow").is_none());
        // Still one warm-up report to skip
        assert!(parser.feed("STAT 100 0 50 0").is_none());
        assert!(parser.feed("STAT 100 0 90 0").is_some());
    }

    #[test]
    fn test_monitor_survives_invalid_utf8() {
        let output: &[u8] = b"\xff\xfe noise\nSTAT 100 0 90 0\n";
        let mut monitor = StreamMonitor::attach(Cursor::new(output), 0).unwrap();
        assert_eq!(
            monitor.join(),
            vec![LossReport {
                total_slots: 100,
                filled_slots: 90
            }]
        );
    }

    #[test]
    fn test_relay_drains_stream() {
        let output = "[info] starting\n[error] oops\nplain\n";
        let mut relay = LogRelay::attach("spectrometer", Cursor::new(output)).unwrap();
        assert_eq!(relay.join(), vec!["[info] starting", "[error] oops", "plain"]);
        assert!(relay.stop().is_empty());
    }

    #[test]
    fn test_relay_keeps_tail() {
        let output: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let mut relay = LogRelay::attach("spectrometer", Cursor::new(output)).unwrap();
        let tail = relay.join();
        assert_eq!(tail.len(), RELAY_TAIL_LINES);
        assert_eq!(tail.first().map(String::as_str), Some("line 30"));
        assert_eq!(tail.last().map(String::as_str), Some("line 49"));
    }

    #[test]
    fn test_relay_survives_invalid_utf8() {
        let output: &[u8] = b"[info] Ready\n\xe4 garbled\n[info] Finished\n";
        let mut relay = LogRelay::attach("spectrometer", Cursor::new(output)).unwrap();
        let tail = relay.join();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[1], "\u{fffd} garbled");
        assert_eq!(tail[2], "[info] Finished");
    }

    #[test]
    fn test_stop_closed_pipe() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "echo STAT 100 0 50 0; exec sleep 30"])
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut monitor = StreamMonitor::attach(stdout, 0).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();
        // Returns once the pipe hits EOF; whether the line was read first is a race
        let _ = monitor.stop();
        assert!(monitor.stop().is_empty());
    }
}
