use std::{
    io::{BufRead, BufReader, ErrorKind, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use json::JsonValue;
use log::{debug, info, warn};

use crate::{
    common::{Fix, FixQuality, Pacer, RunControl, PAUSE_SLICE},
    error::{DashCamError, Result},
};

const GPSD_WATCH: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";

/// Anything that yields GPS readings, one call per read window.
pub(crate) trait GpsSource: Send {
    /**
     * Blocks for at most one read window.
     * `Ok(None)` means nothing usable arrived in that window; `Err` means the
     * source itself is unavailable and the caller should back off.
     */
    fn next_reading(&mut self) -> Result<Option<Fix>>;
}

/// Read side of the fix stream, handed to whoever needs "the fix right now".
pub(crate) trait FixProvider: Send + Sync {
    fn latest(&self) -> Fix;
}

#[derive(Debug)]
struct Latest {
    fix: Fix,
    readings: u64,
}

impl Default for Latest {
    /// Readers see "no fix" until the first reading lands.
    fn default() -> Self {
        Self {
            fix: Fix::no_fix(),
            readings: 0,
        }
    }
}

/**
 * The single "latest fix" slot. One writer (the stream thread), any number of
 * readers. The whole record is swapped under the lock so a reader never sees
 * fields from two different readings.
 */
#[derive(Debug, Default)]
pub(crate) struct FixSlot {
    latest: Mutex<Latest>,
}

impl FixSlot {
    fn publish(&self, fix: Fix) {
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.fix = fix;
        latest.readings += 1;
    }

    /// Number of readings published so far.
    pub(crate) fn readings(&self) -> u64 {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).readings
    }
}

impl FixProvider for FixSlot {
    fn latest(&self) -> Fix {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).fix.clone()
    }
}

/// Released when the acquisition thread leaves its loop, even by panic.
#[derive(Debug, Default)]
struct ExitLatch {
    exited: Mutex<bool>,
    exited_cv: Condvar,
}

impl ExitLatch {
    fn release(&self) {
        *self.exited.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.exited_cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let exited = self.exited.lock().unwrap_or_else(|e| e.into_inner());
        let (exited, _) = self
            .exited_cv
            .wait_timeout_while(exited, timeout, |exited| !*exited)
            .unwrap_or_else(|e| e.into_inner());
        *exited
    }
}

struct ExitGuard(Arc<ExitLatch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub(crate) struct FixStream {
    slot: Arc<FixSlot>,
    stop_requested: Arc<AtomicBool>,
    exit_latch: Arc<ExitLatch>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

/**
 * Entry point for the acquisition thread. The returned stream keeps running
 * until `stop()` is called or `run_control` leaves RUNNING.
 */
pub(crate) fn start_fix_stream<S>(
    source: S,
    run_control: Arc<RunControl>,
    pacer: Arc<dyn Pacer>,
    retry_interval: Duration,
) -> FixStream
where
    S: GpsSource + 'static,
{
    let slot = Arc::new(FixSlot::default());
    let stop_requested = Arc::new(AtomicBool::new(false));
    let exit_latch = Arc::new(ExitLatch::default());

    let thread_slot = slot.clone();
    let thread_stop = stop_requested.clone();
    let thread_latch = exit_latch.clone();
    let thread_handle = thread::spawn(move || {
        let _guard = ExitGuard(thread_latch);
        info!("Starting GPS fix stream...");
        _main_fix_stream_loop(
            source,
            &thread_slot,
            &thread_stop,
            &run_control,
            pacer.as_ref(),
            retry_interval,
        );
        info!("GPS fix stream stopped.");
    });

    FixStream {
        slot,
        stop_requested,
        exit_latch,
        thread_handle: Some(thread_handle),
    }
}

fn _main_fix_stream_loop<S: GpsSource>(
    mut source: S,
    slot: &FixSlot,
    stop_requested: &AtomicBool,
    run_control: &RunControl,
    pacer: &dyn Pacer,
    retry_interval: Duration,
) {
    let keep_going = || run_control.is_running() && !stop_requested.load(Ordering::SeqCst);

    while keep_going() {
        match source.next_reading() {
            Ok(Some(fix)) => slot.publish(fix),
            Ok(None) => {}
            Err(e) => {
                // Keep the stale fix; it stays the best answer until a new one lands.
                debug!("{}; retrying in {:?}", e, retry_interval);
                let mut waited = Duration::ZERO;
                while waited < retry_interval && keep_going() {
                    let slice = (retry_interval - waited).min(PAUSE_SLICE);
                    pacer.sleep(slice);
                    waited += slice;
                }
            }
        }
    }
}

impl FixStream {
    pub(crate) fn latest(&self) -> Fix {
        self.slot.latest()
    }

    /// Shared read handle for the capture cycle.
    pub(crate) fn reader(&self) -> Arc<FixSlot> {
        self.slot.clone()
    }

    /// Asks the loop to exit; observed within one read window.
    pub(crate) fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /**
     * Waits up to `timeout` for the loop to exit. On timeout the thread is left
     * detached and an error is returned so shutdown can carry on without it.
     */
    pub(crate) fn join(&mut self, timeout: Duration) -> Result<()> {
        let Some(handle) = self.thread_handle.take() else {
            return Ok(());
        };

        if !self.exit_latch.wait(timeout) {
            warn!("GPS fix stream did not exit within {:?}", timeout);
            return Err(DashCamError::ShutdownStep(format!(
                "fix stream still running after {:?}",
                timeout
            )));
        }

        handle
            .join()
            .map_err(|_| DashCamError::ShutdownStep("fix stream thread panicked".to_string()))
    }
}

/**
 * gpsd client speaking the JSON watch protocol over TCP. The connection is
 * opened lazily and dropped on any socket error; the next call reconnects.
 */
pub(crate) struct GpsdSource {
    addr: String,
    read_timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
    pending: Vec<u8>,
}

impl GpsdSource {
    pub(crate) fn new(addr: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            read_timeout,
            stream: None,
            pending: Vec::new(),
        }
    }

    fn _connect(&mut self) -> Result<()> {
        let unavailable = |e: std::io::Error| {
            DashCamError::TransientAcquisition(format!("gpsd at {} unavailable: {}", self.addr, e))
        };

        let mut stream = TcpStream::connect(&self.addr).map_err(unavailable)?;
        stream
            .set_read_timeout(Some(self.read_timeout))
            .map_err(unavailable)?;
        stream.write_all(GPSD_WATCH).map_err(unavailable)?;

        info!("Connected to gpsd at {}", self.addr);
        self.pending.clear();
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    fn _disconnect(&mut self) {
        self.stream = None;
        self.pending.clear();
    }
}

impl GpsSource for GpsdSource {
    fn next_reading(&mut self) -> Result<Option<Fix>> {
        if self.stream.is_none() {
            self._connect()?;
        }
        let Some(reader) = self.stream.as_mut() else {
            return Ok(None);
        };

        // Bytes of a line cut short by the read timeout stay in `pending`.
        match reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => {
                self._disconnect();
                Err(DashCamError::TransientAcquisition(
                    "gpsd closed the connection".to_string(),
                ))
            }
            Ok(_) => {
                if !self.pending.ends_with(b"\n") {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.pending);
                parse_report(&String::from_utf8_lossy(&line))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => {
                self._disconnect();
                Err(DashCamError::TransientAcquisition(format!(
                    "gpsd read failed: {}",
                    e
                )))
            }
        }
    }
}

/// Turns one gpsd JSON line into a fix. Only TPV reports carry one.
pub(crate) fn parse_report(line: &str) -> Result<Option<Fix>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let report = json::parse(line).map_err(|e| {
        DashCamError::TransientAcquisition(format!("malformed gpsd report: {}", e))
    })?;
    if report["class"].as_str() != Some("TPV") {
        return Ok(None);
    }

    Ok(Some(_fix_from_tpv(&report)))
}

fn _fix_from_tpv(tpv: &JsonValue) -> Fix {
    Fix {
        latitude: tpv["lat"].as_f64(),
        longitude: tpv["lon"].as_f64(),
        altitude: tpv["altMSL"].as_f64().or_else(|| tpv["alt"].as_f64()),
        speed: tpv["speed"].as_f64(),
        climb: tpv["climb"].as_f64(),
        track: tpv["track"].as_f64(),
        utc: tpv["time"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(String::from),
        quality: FixQuality::from_gpsd_mode(tpv["mode"].as_u64().unwrap_or(0)),
    }
}
