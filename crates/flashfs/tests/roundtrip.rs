//! Random write/truncate sequences compared against an in-memory model.

use std::io::SeekFrom;

use flashfs::{FlashError, OpenFlags, RamFlash, Volume, VolumeConfig};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    /// Write `len` bytes of `fill` at `at` percent of the current length.
    Write { at: u8, len: usize, fill: u8 },
    /// Truncate to `at` percent of the current length.
    Truncate { at: u8 },
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0_u8..=100, 1_usize..700, any::<u8>())
            .prop_map(|(at, len, fill)| Op::Write { at, len, fill }),
        2 => (0_u8..=100).prop_map(|at| Op::Truncate { at }),
        1 => Just(Op::Flush),
    ]
}

fn mounted(write_cache: bool) -> Volume<RamFlash> {
    let mut cfg = VolumeConfig::with_geometry(16, 4096, 256);
    cfg.write_cache = write_cache;
    let mut vol = Volume::new(RamFlash::new(cfg.phys_size, cfg.block_size), cfg).expect("volume");
    vol.format().expect("format");
    vol.mount().expect("mount");
    vol
}

fn contents(vol: &mut Volume<RamFlash>, fd: u16, len: usize) -> Vec<u8> {
    vol.seek(fd, SeekFrom::Start(0)).expect("rewind");
    let mut out = vec![0_u8; len];
    match vol.read(fd, &mut out) {
        Ok(n) => out.truncate(n),
        Err(FlashError::EndOfObject) => out.clear(),
        Err(err) => panic!("read failed: {err}"),
    }
    out
}

fn run(ops: &[Op], write_cache: bool) -> Result<(), TestCaseError> {
    let mut vol = mounted(write_cache);
    let fd = vol
        .open(b"model", OpenFlags::CREATE | OpenFlags::RDWR)
        .expect("open");
    let mut model: Vec<u8> = Vec::new();
    for op in ops {
        match *op {
            Op::Write { at, len, fill } => {
                let offset = model.len() * usize::from(at) / 100;
                let data: Vec<u8> = (0..len).map(|i| fill.wrapping_add(i as u8)).collect();
                vol.seek(fd, SeekFrom::Start(offset as u64)).expect("seek");
                prop_assert_eq!(vol.write(fd, &data).expect("write"), len);
                let end = offset + len;
                if end > model.len() {
                    model.resize(end, 0);
                }
                model[offset..end].copy_from_slice(&data);
            }
            Op::Truncate { at } => {
                let size = model.len() * usize::from(at) / 100;
                vol.truncate(fd, size as u32).expect("truncate");
                model.truncate(size);
            }
            Op::Flush => vol.flush(fd).expect("flush"),
        }
        prop_assert_eq!(contents(&mut vol, fd, model.len() + 16), model.clone());
    }
    prop_assert_eq!(vol.check().expect("check").repairs(), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn direct_writes_match_model(ops in proptest::collection::vec(op(), 1..24)) {
        run(&ops, false)?;
    }

    #[test]
    fn cached_writes_match_model(ops in proptest::collection::vec(op(), 1..24)) {
        run(&ops, true)?;
    }
}
