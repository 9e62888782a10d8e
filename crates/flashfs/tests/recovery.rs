//! Consistency checker against planted corruption and interrupted writes.

use std::io::SeekFrom;
use std::sync::{Arc, Mutex};

use flashfs::{
    CheckAction, CheckKind, CheckReport, FlashError, OpenFlags, RamFlash, Volume, VolumeConfig,
};
use flashfs_types::{IndexKind, IndexView};

const RW: OpenFlags = OpenFlags::CREATE.union(OpenFlags::RDWR).union(OpenFlags::DIRECT);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn config(blocks: u32) -> VolumeConfig {
    VolumeConfig::with_geometry(blocks, 4096, 256)
}

fn mounted(blocks: u32) -> Volume<RamFlash> {
    let cfg = config(blocks);
    let mut vol = Volume::new(RamFlash::new(cfg.phys_size, cfg.block_size), cfg).expect("volume");
    vol.format().expect("format");
    vol.mount().expect("mount");
    vol
}

/// Reboot onto whatever the media holds now.
fn remount(vol: Volume<RamFlash>) -> Volume<RamFlash> {
    let cfg = vol.config().clone();
    let image = vol.into_flash().image().to_vec();
    let mut vol = Volume::new(RamFlash::from_image(image, cfg.block_size), cfg).expect("volume");
    vol.mount().expect("mount");
    vol
}

fn write_file(vol: &mut Volume<RamFlash>, name: &[u8], data: &[u8]) -> flashfs::Result<()> {
    let fd = vol.open(name, RW | OpenFlags::TRUNC)?;
    let res = vol.write(fd, data);
    vol.close(fd)?;
    res.map(|_| ())
}

fn read_file(vol: &mut Volume<RamFlash>, name: &[u8]) -> flashfs::Result<Vec<u8>> {
    let fd = vol.open(name, OpenFlags::RDONLY)?;
    let size = vol.fstat(fd)?.size as usize;
    let mut out = vec![0_u8; size];
    let res = if size == 0 { Ok(0) } else { vol.read(fd, &mut out) };
    vol.close(fd)?;
    out.truncate(res?);
    Ok(out)
}

/// Page index of data span `span` of `name`, read from the raw header.
fn data_page_of(vol: &mut Volume<RamFlash>, name: &[u8], span: usize) -> u16 {
    let st = vol.stat(name).expect("stat");
    let geo = *vol.geometry();
    let start = (geo.page_addr(st.hdr_pix) - geo.phys_addr()) as usize;
    let page = vol.flash().image()[start..start + geo.page_len()].to_vec();
    IndexView::new(IndexKind::Header, &page[..])
        .expect("view")
        .ptr(span)
        .expect("pointer")
}

#[test]
fn deleted_lookup_entry_is_repaired() {
    init_tracing();
    let mut vol = mounted(8);
    let data: Vec<u8> = (0..600_u32).map(|i| (i % 251) as u8).collect();
    write_file(&mut vol, b"victim", &data).expect("write");
    let before = data_page_of(&mut vol, b"victim", 1);

    let geo = *vol.geometry();
    let (bix, entry) = geo.page_to_entry(before);
    vol.flash_mut()
        .poke(geo.lookup_entry_addr(bix, entry), &[0, 0])
        .expect("poke");

    let summary = vol.check().expect("check");
    assert!(summary.repairs() > 0);
    let after = data_page_of(&mut vol, b"victim", 1);
    assert_ne!(after, before, "page must be rewritten elsewhere");
    assert_eq!(read_file(&mut vol, b"victim").expect("read"), data);
}

#[test]
fn second_check_is_a_no_op() {
    let mut vol = mounted(8);
    write_file(&mut vol, b"a", &[1; 900]).expect("a");
    write_file(&mut vol, b"b", &[2; 40]).expect("b");
    let victim = data_page_of(&mut vol, b"a", 2);
    let geo = *vol.geometry();
    // zero the span field of a data page header
    vol.flash_mut()
        .poke(geo.page_addr(victim) + 2, &[0, 0])
        .expect("poke");

    let first = vol.check().expect("first");
    assert!(first.repairs() > 0);
    let second = vol.check().expect("second");
    assert_eq!(second.repairs(), 0, "{second:?}");
    assert_eq!(read_file(&mut vol, b"b").expect("b"), vec![2; 40]);
    assert_eq!(read_file(&mut vol, b"a").expect("a").len(), 900);
}

#[test]
fn listener_receives_structured_reports() {
    let mut vol = mounted(8);
    write_file(&mut vol, b"l", &[7; 300]).expect("write");
    let victim = data_page_of(&mut vol, b"l", 0);
    let geo = *vol.geometry();
    let (bix, entry) = geo.page_to_entry(victim);
    vol.flash_mut()
        .poke(geo.lookup_entry_addr(bix, entry), &[0, 0])
        .expect("poke");

    let seen: Arc<Mutex<Vec<CheckReport>>> = Arc::default();
    let sink = Arc::clone(&seen);
    vol.set_check_listener(Some(Box::new(move |r: &CheckReport| {
        sink.lock().expect("lock").push(*r);
    })));
    let summary = vol.check().expect("check");

    let seen = seen.lock().expect("lock");
    assert!(seen.iter().any(|r| r.kind == CheckKind::Lookup
        && matches!(r.action, CheckAction::FixIndex { .. } | CheckAction::FixLookup { .. })));
    assert!(!seen.iter().any(|r| matches!(r.action, CheckAction::Error { .. })));
    let json = serde_json::to_value(summary).expect("json");
    assert_eq!(json["index_fixes"], summary.index_fixes);
    let report = serde_json::to_string(&seen[0]).expect("report json");
    assert!(report.contains("Progress"));
}

/// Create, append, overwrite across the end and truncate one file.
fn scribble(vol: &mut Volume<RamFlash>, data: &[u8]) -> flashfs::Result<()> {
    let fd = vol.open(b"fresh", RW)?;
    vol.write(fd, &data[..500])?;
    vol.seek(fd, SeekFrom::Start(100))?;
    vol.write(fd, &data[100..900])?;
    vol.truncate(fd, 640)?;
    vol.close(fd)
}

#[test]
fn power_cut_during_writes_is_recoverable() {
    init_tracing();
    let stable: Vec<u8> = (0..777_u32).map(|i| (i * 3) as u8).collect();
    let fresh: Vec<u8> = (0..900_u32).map(|i| (i * 5) as u8).collect();
    for cut in (0..60).step_by(3) {
        let mut vol = mounted(8);
        write_file(&mut vol, b"stable", &stable).expect("stable");

        vol.flash_mut().arm_power_cut(cut);
        let outcome = scribble(&mut vol, &fresh);
        if outcome.is_ok() {
            continue;
        }
        assert!(matches!(outcome, Err(FlashError::Media { .. })), "cut {cut}: {outcome:?}");
        vol.flash_mut().restore_power();

        let mut vol = remount(vol);
        vol.check().unwrap_or_else(|err| panic!("cut {cut}: check failed: {err}"));
        let again = vol.check().expect("second check");
        assert_eq!(again.repairs(), 0, "cut {cut}: {again:?}");
        assert_eq!(read_file(&mut vol, b"stable").expect("stable"), stable, "cut {cut}");
        match read_file(&mut vol, b"fresh") {
            Ok(back) => assert!(back.len() <= 900, "cut {cut}"),
            Err(FlashError::NotFound) => {}
            Err(err) => panic!("cut {cut}: fresh unreadable: {err}"),
        }
        write_file(&mut vol, b"after", b"volume still writable").expect("write after repair");
    }
}

#[test]
fn check_requires_mount() {
    let cfg = config(8);
    let mut vol = Volume::new(RamFlash::new(cfg.phys_size, cfg.block_size), cfg).expect("volume");
    assert_eq!(vol.check(), Err(FlashError::NotMounted));
}
