use std::sync::Arc;
use std::thread;

use opcap_common::{RecordKind, SampleRecord, decode_map_records};
use opcapd::{
    CaptureError, ConsumedEvent, Config, MappedFile, MmapRequest, ProcessImage, ProcessSource,
    Region, Subsystem, WatchedOp,
};

struct OneProcess(ProcessImage);

impl ProcessSource for OneProcess {
    fn snapshot(&self, pid: u32) -> opcapd::Result<ProcessImage> {
        if pid == self.0.pid {
            Ok(self.0.clone())
        } else {
            Err(CaptureError::Snapshot {
                pid,
                reason: "gone".to_string(),
            })
        }
    }
}

fn image() -> ProcessImage {
    let region = |start: u64, path: &str| Region {
        start,
        end: start + 0x1000,
        offset: 0,
        executable: true,
        file: Some(MappedFile::Path(path.into())),
    };
    ProcessImage {
        pid: 500,
        regions: vec![
            region(0x40_0000, "/usr/bin/python3.12"),
            region(0x7f00_0000_0000, "/usr/lib/x86_64-linux-gnu/libc.so.6"),
            Region {
                executable: false,
                ..region(0x7f00_0000_1000, "/usr/lib/x86_64-linux-gnu/libc.so.6")
            },
            region(0x7f00_0001_0000, "/usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2"),
        ],
    }
}

fn subsystem(map_fragments: usize, sample_capacity: usize) -> Subsystem {
    let mut config = Config::default();
    config.buffer.map_fragments = map_fragments;
    config.buffer.sample_capacity = sample_capacity;
    config.scratch.page_size = 4096;
    config.scratch.max_pages = 16;
    Subsystem::with_source(&config, Arc::new(OneProcess(image()))).unwrap()
}

fn exec_mmap(path: String) -> MmapRequest {
    MmapRequest {
        len: 0x3000,
        prot: libc::PROT_READ | libc::PROT_EXEC,
        offset: 0,
        file: Some(MappedFile::Path(path.into())),
    }
}

#[test]
fn fork_with_new_id_emits_exactly_one_record() {
    let mut sub = subsystem(64, 16);
    let stream = sub.take_stream().unwrap();
    let child = sub
        .registry()
        .fork::<()>(WatchedOp::Clone, 17, || Ok(4242))
        .unwrap();
    assert_eq!(child, 4242);

    let record = stream.try_recv().unwrap().unwrap();
    assert_eq!(record.kind(), RecordKind::Fork);
    assert_eq!(record.pid, 17);
    assert_eq!(record.aux, 4242);
    assert_eq!(stream.try_recv().unwrap(), None);
}

#[test]
fn failed_exec_leaves_no_trace() {
    let mut sub = subsystem(64, 16);
    let stream = sub.take_stream().unwrap();
    let err = sub
        .registry()
        .execve::<(), _>(500, || Err(libc::ENOEXEC))
        .unwrap_err();
    assert_eq!(err, libc::ENOEXEC);

    assert_eq!(stream.try_recv().unwrap(), None);
    assert_eq!(sub.device().capacity_bytes(), 64 * 16);
    assert_eq!(sub.metrics().fragments_written(), 0);
    assert_eq!(sub.metrics().samples_emitted(), 0);
}

#[test]
fn exec_reports_every_executable_region() {
    let mut sub = subsystem(64, 16);
    let consumer = sub.consumer().unwrap();
    sub.registry().execve::<(), ()>(500, || Ok(())).unwrap();

    let events = consumer.drain().unwrap();
    assert_eq!(events.len(), 1);
    let ConsumedEvent::Exec { pid, mappings } = &events[0] else {
        panic!("expected exec, got {:?}", events[0]);
    };
    assert_eq!(*pid, 500);
    let paths: Vec<_> = mappings.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/usr/bin/python3.12",
            "/usr/lib/x86_64-linux-gnu/libc.so.6",
            "/usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2",
        ]
    );
}

#[test]
fn mmap_aux_covers_the_written_record() {
    let mut sub = subsystem(64, 16);
    let stream = sub.take_stream().unwrap();
    let req = exec_mmap("/opt/app/libplugin.so".to_string());
    sub.registry()
        .mmap::<()>(WatchedOp::Mmap, 500, &req, || Ok(0x7f12_3400_0000))
        .unwrap();

    let record = stream.try_recv().unwrap().unwrap();
    assert_eq!(record.kind(), RecordKind::Map);
    sub.device().open().unwrap();
    let bytes = sub.device().read(record.mapping_bytes()).unwrap();
    let mappings = decode_map_records(&bytes).unwrap();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].addr, 0x7f12_3400_0000);
    assert_eq!(mappings[0].len, 0x3000);
    assert_eq!(mappings[0].path, "/opt/app/libplugin.so");
    sub.device().close().unwrap();
}

#[test]
fn exit_and_module_load_carry_no_mapping_data() {
    let mut sub = subsystem(64, 16);
    let stream = sub.take_stream().unwrap();
    sub.registry().init_module::<(), ()>(|| Ok(())).unwrap();
    let code = sub.registry().exit(500, 7, |code| code);
    assert_eq!(code, 7);

    assert_eq!(stream.try_recv().unwrap(), Some(SampleRecord::drop_modules()));
    assert_eq!(stream.try_recv().unwrap(), Some(SampleRecord::exit(500)));
    assert_eq!(sub.metrics().fragments_written(), 0);
}

#[test]
fn concurrent_writers_keep_samples_aligned_with_records() {
    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 50;

    let mut sub = subsystem(2048, 1024);
    let consumer = sub.consumer().unwrap();
    let registry = Arc::clone(sub.registry());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let pid = 1000 + t;
                    let req = exec_mmap(format!("/worker/{t}/lib{i}.so"));
                    let addr = (u64::from(t) << 32) | u64::from(i) << 12;
                    registry
                        .mmap::<()>(WatchedOp::OldMmap, pid, &req, || Ok(addr))
                        .unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let events = consumer.drain().unwrap();
    assert_eq!(events.len(), (THREADS * PER_THREAD) as usize);
    for event in &events {
        let ConsumedEvent::Map { pid, mappings } = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(mappings.len(), 1);
        let t = u32::from(*pid) - 1000;
        let i = (mappings[0].addr >> 12) & 0xfffff;
        assert_eq!(mappings[0].addr >> 32, u64::from(t));
        assert_eq!(mappings[0].path, format!("/worker/{t}/lib{i}.so"));
    }
    assert_eq!(sub.metrics().fragments_lost(), 0);
}

#[test]
fn dropped_mapping_samples_do_not_shift_later_records() {
    let mut sub = subsystem(64, 1);
    let consumer = sub.consumer().unwrap();
    let registry = Arc::clone(sub.registry());
    let mmap = |pid: u32, path: &str, addr: u64| {
        registry
            .mmap::<()>(WatchedOp::Mmap, pid, &exec_mmap(path.to_string()), || Ok(addr))
            .unwrap();
    };

    mmap(1, "/lib/a.so", 0x1000_0000);
    // The channel holds one sample, so both of these are dropped.
    mmap(2, "/lib/b.so", 0x2000_0000);
    registry.execve::<(), ()>(500, || Ok(())).unwrap();
    assert_eq!(sub.metrics().samples_dropped(), 2);

    let assert_single_map = |events: Vec<ConsumedEvent>, want_pid: u16, path: &str, addr: u64| {
        assert_eq!(events.len(), 1);
        let ConsumedEvent::Map { pid, mappings } = &events[0] else {
            panic!("expected map, got {:?}", events[0]);
        };
        assert_eq!(*pid, want_pid);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].path, path);
        assert_eq!(mappings[0].addr, addr);
    };
    assert_single_map(consumer.drain().unwrap(), 1, "/lib/a.so", 0x1000_0000);

    mmap(3, "/lib/c.so", 0x3000_0000);
    assert_single_map(consumer.drain().unwrap(), 3, "/lib/c.so", 0x3000_0000);

    registry.execve::<(), ()>(500, || Ok(())).unwrap();
    let events = consumer.drain().unwrap();
    let [ConsumedEvent::Exec { pid: 500, mappings }] = events.as_slice() else {
        panic!("expected exec, got {events:?}");
    };
    assert_eq!(mappings[0].path, "/usr/bin/python3.12");
    assert_eq!(mappings[0].addr, 0x40_0000);
    assert_eq!(mappings.len(), 3);

    mmap(4, "/lib/d.so", 0x4000_0000);
    assert_single_map(consumer.drain().unwrap(), 4, "/lib/d.so", 0x4000_0000);
    assert_eq!(sub.metrics().fragments_lost(), 0);
}

#[test]
fn shutdown_ends_the_stream() {
    let mut sub = subsystem(64, 16);
    let stream = sub.take_stream().unwrap();
    sub.registry().fork::<()>(WatchedOp::Vfork, 1, || Ok(2)).unwrap();
    let stats = sub.shutdown();
    assert_eq!(stats.fork, 1);
    assert!(stream.recv().unwrap().is_some());
    assert_eq!(stream.recv().unwrap(), None);
}
