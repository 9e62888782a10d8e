//! Object lifecycle through the public volume API, including checks of the
//! raw on-media layout.

use std::io::SeekFrom;

use flashfs::{FlashError, OpenFlags, RamFlash, Volume, VolumeConfig};
use flashfs_types::page::PAGE_HEADER_SIZE;
use flashfs_types::{IndexKind, IndexView, PageHeader};

const RW: OpenFlags = OpenFlags::CREATE.union(OpenFlags::RDWR).union(OpenFlags::DIRECT);

fn mounted(blocks: u32) -> Volume<RamFlash> {
    let cfg = VolumeConfig::with_geometry(blocks, 4096, 256);
    let mut vol = Volume::new(RamFlash::new(cfg.phys_size, cfg.block_size), cfg).expect("volume");
    vol.format().expect("format");
    vol.mount().expect("mount");
    vol
}

fn read_at(vol: &mut Volume<RamFlash>, fd: u16, offset: u64, len: usize) -> Vec<u8> {
    vol.seek(fd, SeekFrom::Start(offset)).expect("seek");
    let mut buf = vec![0_u8; len];
    let n = vol.read(fd, &mut buf).expect("read");
    buf.truncate(n);
    buf
}

fn page(vol: &Volume<RamFlash>, pix: u16) -> Vec<u8> {
    let geo = vol.geometry();
    let start = (geo.page_addr(pix) - geo.phys_addr()) as usize;
    vol.flash().image()[start..start + geo.page_len()].to_vec()
}

#[test]
fn fresh_object_lifecycle() {
    let mut vol = mounted(8);
    let fd = vol.open(b"a.txt", RW).expect("create");
    vol.write(fd, b"hello").expect("append");
    assert_eq!(read_at(&mut vol, fd, 0, 5), b"hello");

    vol.seek(fd, SeekFrom::Start(1)).expect("seek");
    vol.write(fd, b"E").expect("modify");
    assert_eq!(read_at(&mut vol, fd, 0, 5), b"hEllo");

    vol.truncate(fd, 2).expect("truncate");
    assert_eq!(read_at(&mut vol, fd, 0, 5), b"hE");
    assert_eq!(vol.fstat(fd).expect("fstat").size, 2);
    vol.close(fd).expect("close");
    assert_eq!(vol.stat(b"a.txt").expect("stat").size, 2);
}

#[test]
fn cross_page_append_layout() {
    let mut vol = mounted(8);
    let data: Vec<u8> = (0..600_u32).map(|i| (i * 7) as u8).collect();
    let fd = vol.open(b"big", RW).expect("create");
    assert_eq!(vol.write(fd, &data).expect("append"), 600);
    assert_eq!(read_at(&mut vol, fd, 0, 600), data);

    let st = vol.fstat(fd).expect("fstat");
    let hdr_page = page(&vol, st.hdr_pix);
    let view = IndexView::new(IndexKind::Header, &hdr_page[..]).expect("view");
    assert_eq!(view.size(), 600);
    let dps = vol.geometry().data_page_size() as usize;
    for span in 0..3_u16 {
        let pix = view.ptr(usize::from(span)).expect("pointer set");
        let body = page(&vol, pix);
        let hdr = PageHeader::decode(&body).expect("header");
        assert_eq!(hdr.id(), st.id);
        assert_eq!(hdr.span_ix, span);
        assert!(hdr.flags.is_live_final());
        let from = usize::from(span) * dps;
        let to = (from + dps).min(600);
        assert_eq!(&body[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + to - from], &data[from..to]);
    }
    assert_eq!(view.ptr(3), None);
    // header plus three data pages
    assert_eq!(vol.stats().allocated, 4);
}

#[test]
fn truncate_then_append_keeps_prefix() {
    let dps = 251_u32;
    for cut in [dps, dps * 2, 100, dps + 17, 0] {
        let mut vol = mounted(8);
        let original: Vec<u8> = (0..700_u32).map(|i| i as u8).collect();
        let extra = vec![0xA5_u8; 333];
        let fd = vol.open(b"t", RW).expect("create");
        vol.write(fd, &original).expect("write");
        vol.truncate(fd, cut).expect("truncate");
        vol.seek(fd, SeekFrom::End(0)).expect("seek end");
        vol.write(fd, &extra).expect("append");

        let total = cut as usize + extra.len();
        let back = read_at(&mut vol, fd, 0, total + 10);
        assert_eq!(back.len(), total, "cut at {cut}");
        assert_eq!(&back[..cut as usize], &original[..cut as usize]);
        assert_eq!(&back[cut as usize..], &extra[..]);
    }
}

#[test]
fn names_are_unique_and_bounded() {
    let mut vol = mounted(8);
    vol.create(b"one").expect("create");
    assert_eq!(vol.create(b"one"), Err(FlashError::ConflictingName));
    let long = [b'x'; 40];
    assert!(matches!(vol.create(&long), Err(FlashError::NameTooLong { .. })));
    let names: Vec<String> = vol
        .list()
        .expect("list")
        .iter()
        .map(|st| st.name_lossy())
        .collect();
    assert_eq!(names, ["one"]);
}

#[test]
fn content_survives_remount() {
    let mut vol = mounted(8);
    let fd = vol.open(b"persist", RW).expect("create");
    vol.write(fd, &[0x5A; 1000]).expect("write");
    vol.close(fd).expect("close");
    vol.unmount().expect("unmount");

    let cfg = vol.config().clone();
    let image = vol.into_flash().image().to_vec();
    let mut vol = Volume::new(RamFlash::from_image(image, cfg.block_size), cfg).expect("volume");
    assert_eq!(vol.open(b"persist", OpenFlags::RDONLY), Err(FlashError::NotMounted));
    vol.mount().expect("mount");
    let fd = vol.open(b"persist", OpenFlags::RDONLY).expect("open");
    assert_eq!(read_at(&mut vol, fd, 0, 1000), vec![0x5A; 1000]);
}

#[test]
fn open_by_id_and_page_reach_the_same_object() {
    let mut vol = mounted(8);
    let id = vol.create(b"x").expect("create");
    let st = vol.stat(b"x").expect("stat");
    let a = vol.open_by_id(id, OpenFlags::RDWR).expect("by id");
    let b = vol.open_by_page(st.hdr_pix, OpenFlags::RDONLY).expect("by page");
    vol.write(a, b"shared").expect("write");
    vol.flush(a).expect("flush");
    assert_eq!(read_at(&mut vol, b, 0, 6), b"shared");
    // a data page is not an index header
    let data_pix = vol.fstat(a).expect("fstat").hdr_pix;
    let hdr_page = page(&vol, data_pix);
    let view = IndexView::new(IndexKind::Header, &hdr_page[..]).expect("view");
    let data = view.ptr(0).expect("data page");
    assert!(vol.open_by_page(data, OpenFlags::RDONLY).is_err());
}
