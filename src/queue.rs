//! Throttled append queue feeding the ledger sheet.
//!
//! Producers enqueue direct, placeholder and replacement writes; a single
//! background worker drains them in FIFO order. Placeholders reserve their
//! row synchronously at enqueue time so later replacements land on exactly
//! that row. Direct writes claim the cursor row, read it back from the sheet
//! before writing, and re-detect the cursor when the row is already taken.
//! A write whose row is still occupied after re-detection is aborted rather
//! than overwriting anything.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use crate::db::SharedConn;
use crate::detector::PositionDetector;
use crate::error::{LedgerError, Result};
use crate::failures::FailureLog;
use crate::models::{ColumnGroup, CursorState, FailedWrite, Payload, PendingWrite, Reservation, WriteMode};
use crate::positions::PositionStore;
use crate::rate_limit::RateLimiter;
use crate::reservations::ReservationLedger;
use crate::sheet::{format_row, is_blank_row, SheetBackend};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Minimum gap between two remote calls.
    pub min_interval: Duration,
    /// How long the worker waits for an item before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Upper bound on how long `stop` waits for the worker to exit.
    pub stop_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_interval: crate::rate_limit::DEFAULT_MIN_INTERVAL,
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Written(u32),
    Skipped(&'static str),
}

/// State shared by producers and the worker.
struct Core {
    sheet: Arc<dyn SheetBackend>,
    positions: PositionStore,
    ledger: ReservationLedger,
    detector: PositionDetector,
    failures: FailureLog,
    limiter: RateLimiter,
}

impl Core {
    /// Run detection for a cursor that has never been read from the sheet.
    fn ensure_verified(&self, user_id: &str, group: ColumnGroup) -> Result<()> {
        if self.positions.get(user_id, group)?.is_verified() {
            return Ok(());
        }
        info!(user = user_id, %group, "cursor not verified yet; detecting from sheet");
        self.detector.redetect(user_id, group, &self.positions)?;
        Ok(())
    }

    fn row_is_free(&self, group: ColumnGroup, row: u32) -> Result<bool> {
        let rows = self.sheet.read_range(group, Some(row..=row))?;
        Ok(rows.iter().all(|cells| is_blank_row(cells)))
    }

    /// Process one dequeued write; failures are logged and kept for retry.
    fn handle(&self, write: &PendingWrite) {
        let span = info_span!(
            "upload",
            user = %write.user_id,
            group = %write.group,
            mode = write.mode.label(),
            cache_id = write.mode.cache_id().unwrap_or("-"),
        );
        let _enter = span.enter();

        let mut target = None;
        match self.upload(write, &mut target) {
            Ok(Outcome::Written(row)) => {
                info!(row, range = %write.group.range_label(row), "uploaded");
            }
            Ok(Outcome::Skipped(reason)) => {
                warn!(reason, "write skipped");
            }
            Err(e) => {
                if matches!(e, LedgerError::Integrity { .. }) {
                    error!(row = ?target, error = %e, "integrity violation; write aborted");
                } else {
                    error!(row = ?target, error = %e, "upload failed; write dropped");
                }
                if let Err(log_err) = self.failures.record(write, &e.to_string()) {
                    error!(error = %log_err, "could not record failed write");
                }
            }
        }
    }

    fn upload(&self, write: &PendingWrite, target: &mut Option<u32>) -> Result<Outcome> {
        let user = write.user_id.as_str();
        let group = write.group;

        self.limiter.wait();

        let (row, exclusive) = match &write.mode {
            WriteMode::Replacement { reserved_row, .. } => (*reserved_row, true),
            WriteMode::Placeholder { cache_id } => match self.ledger.resolve(cache_id)? {
                Some(row) => (row, true),
                None => return Ok(Outcome::Skipped("placeholder discarded before upload")),
            },
            WriteMode::Direct => {
                self.ensure_verified(user, group)?;
                (self.positions.claim(user, group, None)?, false)
            }
        };
        *target = Some(row);

        let row = if exclusive {
            debug!(row, "reserved row; skipping safety check");
            row
        } else {
            self.safety_check(user, group, row)?
        };
        *target = Some(row);

        self.sheet.write_row(group, row, &format_row(&write.payload))?;

        if let WriteMode::Replacement { cache_id, .. } = &write.mode {
            if !self.ledger.release(cache_id)? {
                debug!(cache_id = %cache_id, "reservation was already released");
            }
        }
        Ok(Outcome::Written(row))
    }

    /// Confirm `row` is blank. If not, re-detect the cursor, claim the
    /// corrected row and check it once more.
    fn safety_check(&self, user: &str, group: ColumnGroup, row: u32) -> Result<u32> {
        if self.row_is_free(group, row)? {
            return Ok(row);
        }
        warn!(row, range = %group.range_label(row), "target row already holds data; cursor is stale");

        let detected = self.detector.redetect(user, group, &self.positions)?;
        let corrected = self.positions.claim(user, group, Some(detected))?;
        if self.row_is_free(group, corrected)? {
            info!(from = row, to = corrected, "moved write to re-detected row");
            return Ok(corrected);
        }
        Err(LedgerError::Integrity {
            user: user.to_string(),
            group,
            row: corrected,
            reason: "row still occupied after re-detection".to_string(),
        })
    }
}

/// Single-consumer background queue writing transactions to the ledger sheet.
pub struct UploadQueue {
    core: Arc<Core>,
    config: QueueConfig,
    tx: Sender<PendingWrite>,
    rx: Mutex<Option<Receiver<PendingWrite>>>,
    depth: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UploadQueue {
    pub fn new(conn: SharedConn, sheet: Arc<dyn SheetBackend>, config: QueueConfig) -> Self {
        let limiter = RateLimiter::new(config.min_interval);
        Self::with_rate_limiter(conn, sheet, config, limiter)
    }

    pub fn with_rate_limiter(
        conn: SharedConn,
        sheet: Arc<dyn SheetBackend>,
        config: QueueConfig,
        limiter: RateLimiter,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let core = Core {
            detector: PositionDetector::new(Arc::clone(&sheet)),
            sheet,
            positions: PositionStore::new(conn.clone()),
            ledger: ReservationLedger::new(conn.clone()),
            failures: FailureLog::new(conn),
            limiter,
        };
        Self {
            core: Arc::new(core),
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            busy: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Spawn the worker thread. Writes enqueued before this are kept.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            warn!("upload queue already running");
            return Ok(());
        }
        let rx = self
            .rx
            .lock()
            .map_err(|_| LedgerError::Other("queue receiver lock poisoned".into()))?
            .take()
            .ok_or(LedgerError::QueueStopped)?;

        let worker = Worker {
            core: Arc::clone(&self.core),
            rx,
            depth: Arc::clone(&self.depth),
            busy: Arc::clone(&self.busy),
            shutdown: Arc::clone(&self.shutdown),
            poll_interval: self.config.poll_interval,
        };
        let handle = std::thread::Builder::new()
            .name("sheet-upload".into())
            .spawn(move || worker.run())?;
        self.handle = Some(handle);
        info!("upload queue started");
        Ok(())
    }

    /// Ask the worker to exit after its current item and wait a bounded time
    /// for it. Items still queued are abandoned.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + self.config.stop_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("upload worker panicked");
                }
            } else {
                warn!(timeout_ms = self.config.stop_timeout.as_millis() as u64, "upload worker still busy; detaching");
            }
        }
        let abandoned = self.depth.load(Ordering::SeqCst);
        if abandoned > 0 {
            warn!(abandoned, "queued writes abandoned at shutdown");
        }
        info!("upload queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Block until nothing is queued or in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.depth.load(Ordering::SeqCst) == 0 && !self.busy.load(Ordering::SeqCst) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn enqueue_direct(&self, user_id: &str, group: ColumnGroup, payload: Payload) -> Result<()> {
        payload.validate()?;
        self.submit(PendingWrite::new(user_id, group, payload, WriteMode::Direct))
    }

    /// Reserve a row for a provisional write and queue it. The reservation is
    /// taken before returning, so back-to-back placeholders never share a row.
    pub fn enqueue_placeholder(&self, user_id: &str, group: ColumnGroup, payload: Payload) -> Result<String> {
        payload.validate()?;
        if !self.core.positions.get(user_id, group)?.is_verified() {
            self.core.limiter.wait();
            self.core.ensure_verified(user_id, group)?;
        }
        let reservation = self.core.ledger.reserve(user_id, group, &payload)?;
        let cache_id = reservation.cache_id.clone();
        self.submit(PendingWrite::new(
            user_id,
            group,
            payload,
            WriteMode::Placeholder { cache_id: cache_id.clone() },
        ))?;
        Ok(cache_id)
    }

    /// Queue the final version of a placeholder onto its reserved row.
    pub fn enqueue_replacement(
        &self,
        user_id: &str,
        cache_id: &str,
        group: ColumnGroup,
        payload: Payload,
    ) -> Result<()> {
        payload.validate()?;
        let reservation = self
            .core
            .ledger
            .get(cache_id)?
            .ok_or_else(|| LedgerError::UnknownReservation(cache_id.to_string()))?;
        if reservation.user_id != user_id || reservation.group != group {
            return Err(LedgerError::InvalidRequest(format!(
                "reservation {cache_id} belongs to {} ({}), not {user_id} ({group})",
                reservation.user_id, reservation.group
            )));
        }
        info!(user = user_id, %group, cache_id, row = reservation.row, "queued replacement");
        self.submit(PendingWrite::new(
            user_id,
            group,
            payload,
            WriteMode::Replacement {
                cache_id: cache_id.to_string(),
                reserved_row: reservation.row,
            },
        ))
    }

    /// Forget the cached cursor and rebuild it from the sheet.
    pub fn reset_cursor(&self, user_id: &str, group: ColumnGroup) -> Result<u32> {
        warn!(user = user_id, %group, "resetting cursor from sheet");
        self.core.positions.invalidate(user_id, group)?;
        self.core.limiter.wait();
        self.core.detector.redetect(user_id, group, &self.core.positions)
    }

    /// Drop a placeholder's reservation. Its row is not handed out again.
    pub fn discard(&self, cache_id: &str) -> Result<bool> {
        self.core.ledger.release(cache_id)
    }

    /// Discard a user's open reservations and failed writes; the cursors stay.
    pub fn clear_session(&self, user_id: &str) -> Result<(usize, usize)> {
        let reservations = self.core.ledger.clear_user(user_id)?;
        let failures = self.core.failures.clear_user(user_id)?;
        info!(user = user_id, reservations, failures, "session cleared");
        Ok((reservations, failures))
    }

    /// Re-enqueue every failed write of a user in its original order.
    pub fn retry_failed(&self, user_id: &str) -> Result<usize> {
        let writes = self.core.failures.take(user_id)?;
        let mut queued = 0;
        for write in writes {
            match self.submit(write.clone()) {
                Ok(()) => queued += 1,
                Err(e) => {
                    self.core.failures.record(&write, &e.to_string())?;
                }
            }
        }
        info!(user = user_id, queued, "failed writes re-queued");
        Ok(queued)
    }

    pub fn failed(&self, user_id: &str) -> Result<Vec<FailedWrite>> {
        self.core.failures.list(user_id)
    }

    pub fn reservation(&self, cache_id: &str) -> Result<Option<Reservation>> {
        self.core.ledger.get(cache_id)
    }

    pub fn pending(&self, user_id: &str) -> Result<Vec<Reservation>> {
        self.core.ledger.list(user_id)
    }

    pub fn cursor(&self, user_id: &str, group: ColumnGroup) -> Result<CursorState> {
        self.core.positions.get(user_id, group)
    }

    fn submit(&self, write: PendingWrite) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(LedgerError::QueueStopped);
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(write).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(LedgerError::QueueStopped);
        }
        debug!(depth = self.queue_depth(), "write queued");
        Ok(())
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

struct Worker {
    core: Arc<Core>,
    rx: Receiver<PendingWrite>,
    depth: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Worker {
    fn run(self) {
        info!("upload worker started");
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(write) => {
                    self.busy.store(true, Ordering::SeqCst);
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    self.core.handle(&write);
                    self.busy.store(false, Ordering::SeqCst);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("upload worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::ops::RangeInclusive;

    use super::*;
    use crate::db::tests::test_db;
    use crate::rate_limit::tests::PausingClock;
    use crate::sheet::tests::MemorySheet;

    const PLACEHOLDER: &str = "! Nog in te delen !";

    fn config() -> QueueConfig {
        QueueConfig {
            min_interval: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn payload(desc: &str, category: &str) -> Payload {
        Payload {
            date: "2025-04-24".into(),
            amount: -42.0,
            description: desc.into(),
            category: category.into(),
        }
    }

    fn queue_with(conn: SharedConn, sheet: Arc<dyn SheetBackend>) -> UploadQueue {
        let mut q = UploadQueue::new(conn, sheet, config());
        q.start().unwrap();
        q
    }

    fn drain(q: &UploadQueue) {
        assert!(q.wait_idle(Duration::from_secs(5)), "queue did not drain");
    }

    /// Reports every row as occupied when read one at a time.
    struct AlwaysOccupied {
        inner: MemorySheet,
    }

    impl SheetBackend for AlwaysOccupied {
        fn read_range(&self, group: ColumnGroup, rows: Option<RangeInclusive<u32>>) -> Result<Vec<Vec<String>>> {
            match rows {
                Some(r) => Ok(r.map(|_| vec!["someone else".to_string()]).collect()),
                None => self.inner.read_range(group, None),
            }
        }

        fn write_row(&self, group: ColumnGroup, row: u32, values: &[String]) -> Result<()> {
            self.inner.write_row(group, row, values)
        }
    }

    /// Fails every write with a remote error.
    struct Unreachable {
        inner: MemorySheet,
    }

    impl SheetBackend for Unreachable {
        fn read_range(&self, group: ColumnGroup, rows: Option<RangeInclusive<u32>>) -> Result<Vec<Vec<String>>> {
            self.inner.read_range(group, rows)
        }

        fn write_row(&self, _group: ColumnGroup, _row: u32, _values: &[String]) -> Result<()> {
            Err(LedgerError::Remote("quota exceeded".into()))
        }
    }

    /// Pauses on every read and logs the rows written.
    struct SlowSheet {
        inner: MemorySheet,
        delay: Duration,
        written: Mutex<Vec<u32>>,
    }

    impl SlowSheet {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemorySheet::new(),
                delay,
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl SheetBackend for SlowSheet {
        fn read_range(&self, group: ColumnGroup, rows: Option<RangeInclusive<u32>>) -> Result<Vec<Vec<String>>> {
            std::thread::sleep(self.delay);
            self.inner.read_range(group, rows)
        }

        fn write_row(&self, group: ColumnGroup, row: u32, values: &[String]) -> Result<()> {
            self.written.lock().unwrap().push(row);
            self.inner.write_row(group, row, values)
        }
    }

    #[test]
    fn test_direct_write_detects_then_appends() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Expense, 1..=3);
        let mut q = queue_with(conn, sheet.clone());

        q.enqueue_direct("u1", ColumnGroup::Expense, payload("JUMBO", "Boodschappen")).unwrap();
        q.enqueue_direct("u1", ColumnGroup::Expense, payload("LIDL", "Boodschappen")).unwrap();
        drain(&q);

        assert_eq!(sheet.row(ColumnGroup::Expense, 4)[2], "JUMBO");
        assert_eq!(sheet.row(ColumnGroup::Expense, 5)[2], "LIDL");
        let cursor = q.cursor("u1", ColumnGroup::Expense).unwrap();
        assert_eq!(cursor.next_row, 6);
        assert!(cursor.is_verified());
        q.stop();
    }

    #[test]
    fn test_placeholder_rows_are_distinct_and_increasing() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Income, 1..=4);
        let q = UploadQueue::new(conn, sheet, config());

        let ids: Vec<String> = (0..4)
            .map(|i| q.enqueue_placeholder("u1", ColumnGroup::Income, payload(&format!("p{i}"), PLACEHOLDER)).unwrap())
            .collect();
        let rows: Vec<u32> = q.pending("u1").unwrap().iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![5, 6, 7, 8]);
        assert_eq!(q.queue_depth(), 4);
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_reserve_replace_then_direct_scenario() {
        let (_dir, conn) = test_db();
        PositionStore::new(conn.clone()).record_detection("u1", ColumnGroup::Expense, 5).unwrap();
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Expense, 1..=4);
        let mut q = queue_with(conn, sheet.clone());

        let p1 = q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("AH", PLACEHOLDER)).unwrap();
        let p2 = q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("Kruidvat", PLACEHOLDER)).unwrap();
        drain(&q);
        q.enqueue_replacement("u1", &p1, ColumnGroup::Expense, payload("AH", "Groceries")).unwrap();
        q.enqueue_direct("u1", ColumnGroup::Expense, payload("NS", "Auto / vervoer / OV")).unwrap();
        drain(&q);

        assert_eq!(sheet.row(ColumnGroup::Expense, 5)[3], "Groceries");
        assert_eq!(sheet.row(ColumnGroup::Expense, 6)[3], PLACEHOLDER);
        assert_eq!(sheet.row(ColumnGroup::Expense, 7)[2], "NS");

        let open: Vec<String> = q.pending("u1").unwrap().into_iter().map(|r| r.cache_id).collect();
        assert_eq!(open, vec![p2]);
        assert_eq!(q.cursor("u1", ColumnGroup::Expense).unwrap().next_row, 8);
        q.stop();
    }

    #[test]
    fn test_replacement_targets_reserved_row_after_other_writes() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Expense, 1..=1);
        let mut q = queue_with(conn, sheet.clone());

        let id = q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("held", PLACEHOLDER)).unwrap();
        for i in 0..5 {
            q.enqueue_direct("u1", ColumnGroup::Expense, payload(&format!("d{i}"), "Snacken")).unwrap();
        }
        drain(&q);
        q.enqueue_replacement("u1", &id, ColumnGroup::Expense, payload("held", "Huishouden")).unwrap();
        drain(&q);

        assert_eq!(sheet.row(ColumnGroup::Expense, 2)[3], "Huishouden");
        assert_eq!(sheet.row(ColumnGroup::Expense, 3)[2], "d0");
        assert_eq!(sheet.row(ColumnGroup::Expense, 7)[2], "d4");
        assert!(q.pending("u1").unwrap().is_empty());
        q.stop();
    }

    #[test]
    fn test_replacement_without_reservation_rejected_up_front() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(MemorySheet::new());
        let q = UploadQueue::new(conn, sheet.clone(), config());
        let err = q
            .enqueue_replacement("u1", "deadbeef", ColumnGroup::Expense, payload("x", "Ander"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownReservation(_)));
        assert_eq!(q.queue_depth(), 0);
        assert_eq!(sheet.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_replacement_for_wrong_group_rejected() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(MemorySheet::new());
        let q = UploadQueue::new(conn, sheet, config());
        let id = q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("x", PLACEHOLDER)).unwrap();
        let err = q
            .enqueue_replacement("u1", &id, ColumnGroup::Income, payload("x", "Salaris"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
    }

    #[test]
    fn test_invalid_payload_rejected_before_queueing() {
        let (_dir, conn) = test_db();
        let q = UploadQueue::new(conn, Arc::new(MemorySheet::new()), config());
        let err = q.enqueue_direct("u1", ColumnGroup::Expense, payload("x", "")).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
        assert_eq!(q.queue_depth(), 0);
    }

    #[test]
    fn test_stale_cursor_is_corrected_by_redetection() {
        let (_dir, conn) = test_db();
        // cursor claims row 3 but someone appended through row 6 by hand
        PositionStore::new(conn.clone()).record_detection("u1", ColumnGroup::Expense, 3).unwrap();
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Expense, 1..=6);
        let mut q = queue_with(conn, sheet.clone());

        q.enqueue_direct("u1", ColumnGroup::Expense, payload("late", "Ander")).unwrap();
        drain(&q);

        assert_eq!(sheet.row(ColumnGroup::Expense, 3)[2], "seed 3");
        assert_eq!(sheet.row(ColumnGroup::Expense, 7)[2], "late");
        assert_eq!(q.cursor("u1", ColumnGroup::Expense).unwrap().next_row, 8);
        q.stop();
    }

    #[test]
    fn test_occupied_after_redetection_aborts_without_overwriting() {
        let (_dir, conn) = test_db();
        PositionStore::new(conn.clone()).record_detection("u1", ColumnGroup::Expense, 3).unwrap();
        let inner = MemorySheet::new();
        inner.fill(ColumnGroup::Expense, 1..=5);
        let sheet = Arc::new(AlwaysOccupied { inner });
        let mut q = queue_with(conn, sheet.clone());

        q.enqueue_direct("u1", ColumnGroup::Expense, payload("blocked", "Ander")).unwrap();
        drain(&q);

        assert_eq!(sheet.inner.writes.load(Ordering::SeqCst), 0);
        for r in 2..=5 {
            assert_eq!(sheet.inner.row(ColumnGroup::Expense, r)[2], format!("seed {r}"));
        }
        let failed = q.failed("u1").unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.contains("Integrity"));
        q.stop();
    }

    #[test]
    fn test_worker_survives_remote_failures_and_retry_requeues() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(Unreachable { inner: MemorySheet::new() });
        let mut q = queue_with(conn.clone(), sheet);

        q.enqueue_direct("u1", ColumnGroup::Income, payload("salary", "Salaris")).unwrap();
        q.enqueue_direct("u1", ColumnGroup::Income, payload("bonus", "Bonus")).unwrap();
        drain(&q);
        assert!(q.is_running());
        assert_eq!(q.failed("u1").unwrap().len(), 2);
        q.stop();

        // retry against a reachable sheet
        let healthy = Arc::new(MemorySheet::new());
        let mut q = queue_with(conn, healthy.clone());
        assert_eq!(q.retry_failed("u1").unwrap(), 2);
        drain(&q);
        assert!(q.failed("u1").unwrap().is_empty());
        let descs: Vec<String> = (2..=5)
            .map(|r| healthy.row(ColumnGroup::Income, r)[2].clone())
            .filter(|d| !d.is_empty())
            .collect();
        assert_eq!(descs, vec!["salary".to_string(), "bonus".to_string()]);
        q.stop();
    }

    #[test]
    fn test_discarded_placeholder_is_skipped_and_row_not_reused() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Expense, 1..=1);
        let mut q = UploadQueue::new(conn, sheet.clone(), config());

        let id = q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("gone", PLACEHOLDER)).unwrap();
        assert!(q.discard(&id).unwrap());
        assert!(!q.discard(&id).unwrap());
        q.enqueue_direct("u1", ColumnGroup::Expense, payload("next", "Ander")).unwrap();
        q.start().unwrap();
        drain(&q);

        assert!(is_blank_row(&sheet.row(ColumnGroup::Expense, 2)));
        assert_eq!(sheet.row(ColumnGroup::Expense, 3)[2], "next");
        assert!(q.failed("u1").unwrap().is_empty());
        q.stop();
    }

    #[test]
    fn test_clear_session_keeps_cursor_past_abandoned_rows() {
        let (_dir, conn) = test_db();
        PositionStore::new(conn.clone()).record_detection("u1", ColumnGroup::Expense, 5).unwrap();
        let q = UploadQueue::new(conn, Arc::new(MemorySheet::new()), config());
        q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("a", PLACEHOLDER)).unwrap();
        q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("b", PLACEHOLDER)).unwrap();

        assert_eq!(q.clear_session("u1").unwrap(), (2, 0));
        assert!(q.pending("u1").unwrap().is_empty());
        assert_eq!(q.cursor("u1", ColumnGroup::Expense).unwrap().next_row, 7);
    }

    #[test]
    fn test_restart_uses_persisted_cursor_without_detection() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Expense, 1..=2);
        {
            let mut q = queue_with(crate::db::open_shared(&db_path).unwrap(), sheet.clone());
            q.enqueue_direct("u1", ColumnGroup::Expense, payload("before", "Ander")).unwrap();
            drain(&q);
            q.stop();
        }
        // the sheet is cleared below the cursor; the persisted cursor still wins
        sheet.put(ColumnGroup::Expense, 3, &["", "", "", ""]);
        let reads_before = sheet.reads.load(Ordering::SeqCst);
        let mut q = queue_with(crate::db::open_shared(&db_path).unwrap(), sheet.clone());
        q.enqueue_direct("u1", ColumnGroup::Expense, payload("after", "Ander")).unwrap();
        drain(&q);

        assert_eq!(sheet.row(ColumnGroup::Expense, 4)[2], "after");
        // one safety-check read, no full-column scan
        assert_eq!(sheet.reads.load(Ordering::SeqCst) - reads_before, 1);
        q.stop();
    }

    #[test]
    fn test_reset_cursor_redetects() {
        let (_dir, conn) = test_db();
        PositionStore::new(conn.clone()).record_detection("u1", ColumnGroup::Income, 30).unwrap();
        let sheet = Arc::new(MemorySheet::new());
        sheet.fill(ColumnGroup::Income, 1..=8);
        let q = UploadQueue::new(conn, sheet, config());
        assert_eq!(q.reset_cursor("u1", ColumnGroup::Income).unwrap(), 9);
        assert!(q.cursor("u1", ColumnGroup::Income).unwrap().is_verified());
    }

    #[test]
    fn test_each_item_is_throttled() {
        let (_dir, conn) = test_db();
        PositionStore::new(conn.clone()).record_detection("u1", ColumnGroup::Expense, 2).unwrap();
        let clock = PausingClock::default();
        let limiter = RateLimiter::with_clock(Duration::from_secs(2), clock.clone());
        let mut q = UploadQueue::with_rate_limiter(conn, Arc::new(MemorySheet::new()), config(), limiter);
        q.start().unwrap();
        for i in 0..3 {
            q.enqueue_direct("u1", ColumnGroup::Expense, payload(&format!("t{i}"), "Ander")).unwrap();
        }
        drain(&q);
        assert_eq!(clock.total_slept(), Duration::from_secs(4));
        q.stop();
    }

    #[test]
    fn test_stop_rejects_new_writes() {
        let (_dir, conn) = test_db();
        let mut q = queue_with(conn, Arc::new(MemorySheet::new()));
        q.stop();
        assert!(!q.is_running());
        let err = q.enqueue_direct("u1", ColumnGroup::Expense, payload("x", "Ander")).unwrap_err();
        assert!(matches!(err, LedgerError::QueueStopped));
    }

    #[test]
    fn test_cold_start_detection_race_keeps_direct_write() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(SlowSheet::new(Duration::from_millis(100)));
        sheet.inner.fill(ColumnGroup::Expense, 1..=1);
        let mut q = queue_with(conn, sheet.clone());

        // the worker starts detecting first; the producer detects while it is still scanning
        q.enqueue_direct("u1", ColumnGroup::Expense, payload("DIRECT", "Ander")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let id = q.enqueue_placeholder("u1", ColumnGroup::Expense, payload("HELD", PLACEHOLDER)).unwrap();
        drain(&q);

        let held_row = q.reservation(&id).unwrap().unwrap().row;
        let direct_row = if held_row == 2 { 3 } else { 2 };
        assert_eq!(sheet.inner.row(ColumnGroup::Expense, held_row)[2], "HELD");
        assert_eq!(sheet.inner.row(ColumnGroup::Expense, direct_row)[2], "DIRECT");
        let mut written = sheet.written.lock().unwrap().clone();
        written.sort_unstable();
        assert_eq!(written, vec![2, 3]);
        assert_eq!(q.cursor("u1", ColumnGroup::Expense).unwrap().next_row, 4);
        q.stop();
    }

    #[test]
    fn test_concurrent_placeholders_while_direct_writes_drain() {
        let (_dir, conn) = test_db();
        let sheet = Arc::new(SlowSheet::new(Duration::from_millis(5)));
        sheet.inner.fill(ColumnGroup::Expense, 1..=3);
        let mut q = queue_with(conn, sheet.clone());

        for i in 0..6 {
            q.enqueue_direct("u1", ColumnGroup::Expense, payload(&format!("direct {i}"), "Ander")).unwrap();
        }
        let ids: Vec<(String, String)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|t| {
                    let q = &q;
                    scope.spawn(move || {
                        (0..4)
                            .map(|i| {
                                let desc = format!("held {t}-{i}");
                                let id = q
                                    .enqueue_placeholder("u1", ColumnGroup::Expense, payload(&desc, PLACEHOLDER))
                                    .unwrap();
                                (id, desc)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        drain(&q);

        assert!(q.failed("u1").unwrap().is_empty());
        let written = sheet.written.lock().unwrap().clone();
        assert_eq!(written.len(), 18);
        let mut distinct = written.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), written.len(), "a row was written twice: {written:?}");
        assert!(distinct.iter().all(|&r| r >= 4));

        for (id, desc) in &ids {
            let row = q.reservation(id).unwrap().unwrap().row;
            assert_eq!(&sheet.inner.row(ColumnGroup::Expense, row)[2], desc);
        }
        let directs = distinct
            .iter()
            .filter(|&&r| sheet.inner.row(ColumnGroup::Expense, r)[2].starts_with("direct"))
            .count();
        assert_eq!(directs, 6);
        q.stop();
    }
}
