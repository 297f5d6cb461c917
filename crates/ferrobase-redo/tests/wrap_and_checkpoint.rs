//! Circular-file wrap semantics and checkpoint-age behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ferrobase_redo::data_file::checkpoint_coordinates;
use ferrobase_redo::{
    BufferPool, CircularDataFile, LogFiles, LogSystem, LogSystemOptions, Lsn, MiniTransaction,
    PageId, RedoConfig,
};
use ferrobase_vfs::{LogFile, MemFileIo};

/// Pool whose oldest modification can be pinned, modelling dirty pages
/// that never get flushed.
#[derive(Default)]
struct PinnablePool {
    oldest: Mutex<Option<Lsn>>,
    pinned: AtomicBool,
}

impl PinnablePool {
    fn pin_oldest(&self, lsn: Lsn) {
        *self.oldest.lock().expect("pool poisoned") = Some(lsn);
        self.pinned.store(true, Ordering::Relaxed);
    }
}

impl BufferPool for PinnablePool {
    fn oldest_modification(&self) -> Option<Lsn> {
        *self.oldest.lock().expect("pool poisoned")
    }

    fn insert_flush_list(&self, _page: PageId, _start_lsn: Lsn, _end_lsn: Lsn) {}

    fn preflush(&self, _new_oldest: Lsn) -> bool {
        if !self.pinned.load(Ordering::Relaxed) {
            *self.oldest.lock().expect("pool poisoned") = None;
        }
        true
    }

    fn pending_io(&self) -> usize {
        0
    }

    fn cleaner_is_active(&self) -> bool {
        false
    }
}

fn mem_system(cfg: &RedoConfig, pool: Arc<PinnablePool>) -> (LogSystem, MemFileIo) {
    let main_io = MemFileIo::new();
    let data_io = MemFileIo::with_size(cfg.log_file_size as usize);
    let data_peek = data_io.clone();
    let files = LogFiles::from_parts(
        LogFile::from_io("ib_logfile0", Box::new(main_io)),
        LogFile::from_io("ib_logdata", Box::new(data_io)),
        cfg.log_file_size,
        0,
    );
    let log = LogSystem::start_on(cfg, files, pool, LogSystemOptions::default(), 1, Some(&[]))
        .expect("start log system");
    (log, data_peek)
}

#[test]
fn wrap_splits_the_final_record() {
    let io = MemFileIo::with_size(2048);
    let peek = io.clone();
    let data = CircularDataFile::new(LogFile::from_io("ib_logdata", Box::new(io)), 2048);

    // 2000 bytes of records in sequence-bit era 1.
    for chunk in [800_usize, 700, 500] {
        data.append(&vec![0x11_u8; chunk]).expect("append");
    }
    assert_eq!(data.position_and_bit(), (2000, 1));

    // A 100-byte record splits 48/52 across the file end.
    data.append(&vec![0x22_u8; 100]).expect("wrap append");
    assert_eq!(data.position_and_bit(), (52, 0));

    let contents = peek.contents();
    assert_eq!(&contents[2000..2048], &[0x22_u8; 48][..]);
    assert_eq!(&contents[..52], &[0x22_u8; 52][..]);
    assert_eq!(contents[52], 0x11);
}

#[test]
fn sequence_bit_round_trips_over_two_wraps() {
    let io = MemFileIo::with_size(4096);
    let data = CircularDataFile::new(LogFile::from_io("ib_logdata", Box::new(io)), 4096);

    // Exactly one file worth of bytes: position back to 0, bit 1 -> 0.
    for _ in 0..4 {
        data.append(&vec![9_u8; 1024]).expect("append");
    }
    assert_eq!(data.position_and_bit(), (0, 0));

    // Another full pass restores bit 1.
    for _ in 0..4 {
        data.append(&vec![8_u8; 1024]).expect("append");
    }
    assert_eq!(data.position_and_bit(), (0, 1));
}

#[test]
fn checkpoint_age_overrun_raises_the_sticky_flag() {
    // The smallest configuration the capacity derivation accepts, so
    // the checkpoint age can actually be exhausted by a test workload.
    let cfg = RedoConfig {
        log_buffer_size: 32 * 1024,
        log_file_size: 107 * 512,
        log_write_ahead_size: 512,
        page_size: 512,
        thread_concurrency: 0,
        ..RedoConfig::default()
    };
    let pool = Arc::new(PinnablePool::default());
    let (log, _) = mem_system(&cfg, pool.clone());

    // Dirty pages pinned at the start: no checkpoint can advance.
    pool.pin_oldest(log.lsn());
    let capacity = log.capacity().log_capacity;

    let mut appended = 0_u64;
    while appended <= capacity + 2048 {
        let mut mtr = MiniTransaction::new();
        mtr.append_record(&[6_u8; 999]);
        let lsn = mtr.commit(&log);
        assert!(lsn > 0);
        appended += 1000;
    }

    // The age exceeded the capacity: the flag is up, the warning was
    // throttled rather than fatal, and the log still accepts appends.
    assert!(log.check_flush_or_checkpoint());
    assert!(log.lsn() - log.last_checkpoint_lsn() >= capacity);
    let mut mtr = MiniTransaction::new();
    mtr.append_record(&[6_u8; 100]);
    assert!(mtr.commit(&log) > 0);
}

#[test]
fn checkpoint_record_points_at_live_region_start() {
    let cfg = RedoConfig {
        log_buffer_size: 32 * 1024,
        log_file_size: 1 << 20,
        log_write_ahead_size: 512,
        ..RedoConfig::default()
    };
    let pool = Arc::new(PinnablePool::default());
    let (log, _) = mem_system(&cfg, pool);

    for i in 0..6 {
        let mut mtr = MiniTransaction::new();
        mtr.append_record(&vec![i as u8; 300]);
        mtr.commit(&log);
    }
    assert!(log.checkpoint());

    let checkpoint_lsn = log.last_checkpoint_lsn();
    assert_eq!(checkpoint_lsn, log.lsn());

    let record = log.files().last_checkpoint_record().expect("record");
    assert_eq!(record.lsn, checkpoint_lsn);
    let (offset, bit) = checkpoint_coordinates(checkpoint_lsn, 1 << 20);
    assert_eq!(record.offset, offset);
    assert_eq!(record.sequence_bit, bit);
    assert_eq!(record.offset, (checkpoint_lsn & !511) % (1 << 20));
}

#[test]
fn concurrent_checkpoint_callers_issue_one_durable_write() {
    let cfg = RedoConfig {
        log_buffer_size: 32 * 1024,
        log_file_size: 1 << 20,
        log_write_ahead_size: 512,
        ..RedoConfig::default()
    };
    let pool = Arc::new(PinnablePool::default());
    let (log, _) = mem_system(&cfg, pool);

    let mut mtr = MiniTransaction::new();
    mtr.append_record(&[3_u8; 400]);
    mtr.commit(&log);

    let tail_before = log.files().main_tail();
    let log = Arc::new(log);
    let mut handles = Vec::new();
    for _ in 0..6 {
        let log = Arc::clone(&log);
        handles.push(thread::spawn(move || log.checkpoint()));
    }
    let results: Vec<bool> = handles
        .into_iter()
        .map(|handle| handle.join().expect("checkpoint thread"))
        .collect();

    // One 19-byte record for this checkpoint LSN, no matter how many
    // raced; losers during the write window reported false.
    assert_eq!(log.files().main_tail(), tail_before + 19);
    assert!(results.contains(&true));
    assert_eq!(log.last_checkpoint_lsn(), log.lsn());
}
