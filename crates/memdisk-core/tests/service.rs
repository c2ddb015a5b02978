//! Integration tests for the request servicer through a host.
//!
//! Covers the reference 100 MiB scenario, clamping at the device tail and
//! concurrent dispatch from many threads.

use memdisk_core::{
    ClampPolicy, Completion, DeviceConfig, LoopbackHost, MemDisk, Request, Status, SECTOR_SIZE,
};
use std::sync::Arc;
use std::thread;

fn create(host: &Arc<LoopbackHost>, config: &DeviceConfig) -> MemDisk<LoopbackHost> {
    MemDisk::create(Arc::clone(host), config).unwrap()
}

fn write(host: &LoopbackHost, name: &str, sector: u64, data: &[u8]) -> Completion {
    host.dispatch(name, &mut Request::write(sector, vec![data]))
        .unwrap()
}

fn read(host: &LoopbackHost, name: &str, sector: u64, len: usize) -> (Completion, Vec<u8>) {
    let mut buf = vec![0u8; len];
    let completion = host
        .dispatch(name, &mut Request::read(sector, vec![&mut buf[..]]))
        .unwrap();
    (completion, buf)
}

/// The reference 100 MiB device walk-through
mod reference {
    use super::*;

    #[test]
    fn test_100mib_vdisk0() {
        let host = Arc::new(LoopbackHost::new());
        let mut disk = create(&host, &DeviceConfig::new("vdisk0", 100));
        let device = Arc::clone(disk.device());

        assert_eq!(device.capacity_sectors(), 204_800);
        assert_eq!(host.capacity_of("vdisk0"), Some(204_800));
        assert_eq!(device.buffer_len(), Some(104_857_600));
        let head = device.read_raw(0, 1 << 20).unwrap();
        assert!(head.iter().all(|&b| b == 0));

        assert_eq!(write(&host, "vdisk0", 0, &[0xAA; 512]), Completion::ok(512));
        let (completion, data) = read(&host, "vdisk0", 0, 512);
        assert_eq!(completion, Completion::ok(512));
        assert_eq!(data, vec![0xAA; 512]);

        let last = 204_799;
        assert_eq!(write(&host, "vdisk0", last, &[0xBB; 1024]), Completion::ok(512));
        let tail = device.read_raw(104_857_600 - 512, 512).unwrap();
        assert_eq!(tail, vec![0xBB; 512]);

        disk.destroy().unwrap();
        assert_eq!(device.capacity_sectors(), 0);
        assert!(!host.is_published("vdisk0"));
    }
}

/// End-of-device handling
mod clamping {
    use super::*;

    #[test]
    fn test_tail_crossing_transfers_remainder() {
        let host = Arc::new(LoopbackHost::new());
        let _disk = create(&host, &DeviceConfig::new("c0", 1).with_capacity_sectors(10));
        let dev_size = 10 * SECTOR_SIZE;

        for (sector, len) in [(9u64, 1024usize), (8, 4096), (0, 8192)] {
            let pos = sector * SECTOR_SIZE;
            let expected = (len as u64).min(dev_size - pos);
            let completion = write(&host, "c0", sector, &vec![1u8; len]);
            assert_eq!(completion.transferred, expected, "sector {sector} len {len}");
            assert!(completion.is_ok());
        }
    }

    #[test]
    fn test_beyond_end_transfers_nothing() {
        let host = Arc::new(LoopbackHost::new());
        let disk = create(&host, &DeviceConfig::new("c0", 1).with_capacity_sectors(10));

        for sector in [10u64, 11, 1 << 40, u64::MAX / 2, u64::MAX] {
            assert_eq!(write(&host, "c0", sector, &[0xFF; 512]), Completion::ok(0));
            let (completion, buf) = read(&host, "c0", sector, 512);
            assert_eq!(completion, Completion::ok(0));
            assert!(buf.iter().all(|&b| b == 0));
        }
        assert!(disk
            .device()
            .read_raw(0, 10 * 512)
            .unwrap()
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn test_strict_policy_rejects() {
        let host = Arc::new(LoopbackHost::new());
        let config = DeviceConfig::new("s0", 1)
            .with_capacity_sectors(10)
            .with_clamp_policy(ClampPolicy::Strict);
        let disk = create(&host, &config);

        let completion = write(&host, "s0", 9, &[0xBB; 1024]);
        assert_eq!(completion.status, Status::IoError);
        assert_eq!(completion.to_kernel_result(), -libc::EIO);
        assert!(completion.into_result().is_err());

        assert_eq!(write(&host, "s0", 9, &[0xBB; 512]), Completion::ok(512));
        assert_eq!(disk.stats().rejected, 1);
        assert_eq!(disk.stats().writes, 1);
    }

    #[test]
    fn test_multi_segment_accumulates() {
        let host = Arc::new(LoopbackHost::new());
        let disk = create(&host, &DeviceConfig::new("m0", 1).with_capacity_sectors(64));

        let a = vec![0x01u8; 512];
        let b = vec![0x02u8; 2048];
        let c = vec![0x03u8; 1536];
        let completion = host
            .dispatch("m0", &mut Request::write(4, vec![&a[..], &b[..], &c[..]]))
            .unwrap();
        assert_eq!(completion, Completion::ok(4096));

        let raw = disk.device().read_raw(4 * 512, 4096).unwrap();
        assert_eq!(&raw[..512], &a[..]);
        assert_eq!(&raw[512..2560], &b[..]);
        assert_eq!(&raw[2560..], &c[..]);
    }
}

/// Concurrent dispatch from several worker threads
mod concurrency {
    use super::*;

    const THREADS: u64 = 8;
    const SECTORS_PER_THREAD: u64 = 64;

    #[test]
    fn test_disjoint_concurrent_writes() {
        let host = Arc::new(LoopbackHost::new());
        let config =
            DeviceConfig::new("p0", 1).with_capacity_sectors(THREADS * SECTORS_PER_THREAD);
        let disk = create(&host, &config);

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let host = Arc::clone(&host);
                thread::spawn(move || {
                    let fill = vec![t as u8 + 1; 512];
                    let base = t * SECTORS_PER_THREAD;
                    let mut total = 0;
                    for s in 0..SECTORS_PER_THREAD {
                        total += write(&host, "p0", base + s, &fill).transferred;
                    }
                    for s in 0..SECTORS_PER_THREAD {
                        let (completion, data) = read(&host, "p0", base + s, 512);
                        assert_eq!(completion, Completion::ok(512));
                        assert_eq!(data, fill);
                    }
                    total
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, THREADS * SECTORS_PER_THREAD * 512);

        let stats = disk.stats();
        assert_eq!(stats.writes, THREADS * SECTORS_PER_THREAD);
        assert_eq!(stats.reads, THREADS * SECTORS_PER_THREAD);
        assert_eq!(host.dispatch_count(), 2 * THREADS * SECTORS_PER_THREAD);

        for t in 0..THREADS {
            let raw = disk
                .device()
                .read_raw(t * SECTORS_PER_THREAD * 512, (SECTORS_PER_THREAD * 512) as usize)
                .unwrap();
            assert!(raw.iter().all(|&b| b == t as u8 + 1));
        }
    }

    #[test]
    fn test_destroy_while_dispatching() {
        let host = Arc::new(LoopbackHost::new());
        let mut disk = create(&host, &DeviceConfig::new("d0", 1).with_capacity_sectors(256));
        let device = Arc::clone(disk.device());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let device = Arc::clone(&device);
                thread::spawn(move || {
                    use memdisk_core::BlockOps;
                    let data = [0x5Au8; 4096];
                    let mut ok = 0u64;
                    let mut failed = 0u64;
                    for i in 0..2000u64 {
                        let completion = device.service(&mut Request::write(i % 248, vec![&data[..]]));
                        match completion.status {
                            Status::Ok => {
                                assert_eq!(completion.transferred, 4096);
                                ok += 1;
                            }
                            Status::IoError => {
                                assert_eq!(completion.transferred, 0);
                                failed += 1;
                            }
                        }
                    }
                    (ok, failed)
                })
            })
            .collect();

        disk.destroy().unwrap();

        for w in workers {
            let (ok, failed) = w.join().unwrap();
            assert_eq!(ok + failed, 2000);
        }
        assert!(!device.is_live());
        assert_eq!(device.capacity_sectors(), 0);
    }
}
