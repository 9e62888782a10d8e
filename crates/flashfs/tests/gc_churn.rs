//! Sustained rewrites on a small volume force garbage collection.

use flashfs::{FlashError, Filesystem, RamFlash, VolumeConfig};

fn fresh(blocks: u32) -> Filesystem<RamFlash> {
    let cfg = VolumeConfig::with_geometry(blocks, 4096, 256);
    Filesystem::format(RamFlash::new(cfg.phys_size, cfg.block_size), cfg).expect("format")
}

fn payload(round: usize, file: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i + round * 31 + file * 7) as u8).collect()
}

#[test]
fn rewrites_survive_many_gc_cycles() {
    let fs = fresh(6);
    let names = ["alpha", "beta", "gamma"];
    let lens = [1200, 480, 60];
    for round in 0..120 {
        for (f, name) in names.iter().enumerate() {
            let data = payload(round, f, lens[f]);
            fs.write_all(name, &data).expect("write");
        }
        if round % 10 == 0 {
            for (f, name) in names.iter().enumerate() {
                assert_eq!(fs.read_to_vec(name).expect("read"), payload(round, f, lens[f]));
            }
        }
    }
    let metrics = fs.metrics();
    assert!(metrics.erases > 0, "no block was ever reclaimed");
    assert_eq!(fs.check().expect("check").repairs(), 0);
    for (f, name) in names.iter().enumerate() {
        assert_eq!(fs.read_to_vec(name).expect("read"), payload(119, f, lens[f]));
    }
}

#[test]
fn filling_the_volume_reports_full() {
    let fs = fresh(4);
    let info = fs.info().expect("info");
    let chunk = vec![0xEE_u8; 2000];
    let mut stored = 0_u32;
    let mut n = 0;
    let err = loop {
        match fs.write_all(&format!("f{n}"), &chunk) {
            Ok(()) => stored += chunk.len() as u32,
            Err(err) => break err,
        }
        n += 1;
        assert!(n < 100, "volume never filled up");
    };
    assert!(matches!(err, FlashError::Full | FlashError::NoFreeObjectId), "{err:?}");
    assert!(stored <= info.total);

    // removing a file frees room again
    fs.remove("f0").expect("remove");
    fs.write_all("again", &chunk[..1000]).expect("write after remove");
    assert_eq!(fs.read_to_vec("again").expect("read").len(), 1000);
}

#[test]
fn erase_counts_advance() {
    let fs = fresh(5);
    for round in 0..80 {
        fs.write_all("churn", &payload(round, 0, 700)).expect("write");
    }
    assert!(fs.stats().max_erase_count > 0);
}
