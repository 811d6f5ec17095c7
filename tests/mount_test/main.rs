#[path = "../common/mkfs.rs"]
mod mkfs;

use efsfuse::error::EfsError;
use efsfuse::layout::Fragment;
use efsfuse::session::Session;
use efsfuse::ROOT_INODE;

fn main() {
    statfs_on_fresh_image();
    readdir_on_empty_root();
    dot_lookup_resolves_parent();
    read_across_fragments();
    open_conflict();
    readdir_snapshot_is_stable();
    bad_magic_rejected();
    unsorted_free_list_rejected();
    io_errors_are_not_short_reads();
}

fn open_basic(total_pages: u64) -> (tempfile::NamedTempFile, Session) {
    let file = tempfile::NamedTempFile::new().expect("create temp image");
    mkfs::basic(total_pages).write_to(file.path());
    let session = Session::open(file.path()).expect("mount image");
    (file, session)
}

fn open_image(image: Vec<u8>) -> (tempfile::NamedTempFile, Session) {
    let file = tempfile::NamedTempFile::new().expect("create temp image");
    std::fs::write(file.path(), image).expect("write image");
    let session = Session::open(file.path()).expect("mount image");
    (file, session)
}

fn statfs_on_fresh_image() {
    let (_file, session) = open_basic(1024);
    let stats = session.statfs();

    assert_eq!(stats.blocks, 1024);
    assert_eq!(stats.files, 1);
    // everything but the superblock, the root fragment, and the node
    // block is free
    assert_eq!(stats.bfree, 1024 - 2 - 256);
    assert_eq!(stats.ffree, 254);
}

fn readdir_on_empty_root() {
    let (_file, mut session) = open_basic(1024);

    let fh = session.open_dir(ROOT_INODE, libc::O_RDONLY).expect("opendir root");
    assert!(session.dir_entries(fh).expect("read snapshot").is_empty());
    session.release_dir(fh).expect("releasedir");

    // write access to a directory handle is refused
    assert!(matches!(
        session.open_dir(ROOT_INODE, libc::O_RDWR),
        Err(EfsError::ReadOnly)
    ));
}

fn dot_lookup_resolves_parent() {
    let (_file, session) = open_basic(1024);

    let desc = session.lookup(ROOT_INODE, b".").expect("lookup .");
    assert_eq!(desc.file_id, ROOT_INODE);
    assert!(!desc.is_file());

    let desc = session.lookup(ROOT_INODE, b"..").expect("lookup ..");
    assert_eq!(desc.file_id, ROOT_INODE);

    assert!(matches!(
        session.lookup(ROOT_INODE, b"missing"),
        Err(EfsError::NoEntry { .. })
    ));
}

/// A 6 KiB file split over two non-adjacent single-page fragments; reads
/// must cross the fragment boundary.
fn fragmented_image() -> Vec<u8> {
    let mut fs = mkfs::basic(1024);
    fs.descriptors.push(mkfs::file(
        2,
        ROOT_INODE,
        b"data",
        6144,
        vec![Fragment { location: 258, length: 1 }, Fragment { location: 260, length: 1 }],
    ));
    fs.free = vec![
        Fragment { location: 259, length: 1 },
        Fragment { location: 261, length: 1024 - 261 },
    ];

    let mut image = fs.build();
    mkfs::page_mut(&mut image, 258).fill(0xaa);
    mkfs::page_mut(&mut image, 260).fill(0xbb);
    image
}

fn read_across_fragments() {
    let (_file, session) = open_image(fragmented_image());

    let mut buf = vec![0u8; 2000];
    let n = session.read_file(2, 3000, &mut buf).expect("read");
    assert_eq!(n, 2000);
    assert!(buf[..1096].iter().all(|&b| b == 0xaa));
    assert!(buf[1096..].iter().all(|&b| b == 0xbb));

    // clamped at EOF
    let n = session.read_file(2, 6000, &mut buf).expect("read tail");
    assert_eq!(n, 144);
    assert!(buf[..144].iter().all(|&b| b == 0xbb));

    // at or past EOF reads nothing
    assert_eq!(session.read_file(2, 6144, &mut buf).expect("read at eof"), 0);
    assert_eq!(session.read_file(2, 100_000, &mut buf).expect("read past eof"), 0);
}

fn open_conflict() {
    let (_file, mut session) = open_image(fragmented_image());

    session.open_file(2, libc::O_WRONLY).expect("first open");
    assert!(matches!(session.open_file(2, libc::O_WRONLY), Err(EfsError::AccessDenied(2))));

    session.release_file(2).expect("release");
    session.open_file(2, libc::O_WRONLY).expect("open after release");
    session.release_file(2).expect("release again");
    assert!(matches!(session.release_file(2), Err(EfsError::BadHandle(2))));

    // read-only opens never enter the open set
    session.open_file(2, libc::O_RDONLY).expect("read-only open");
    session.open_file(2, libc::O_RDONLY).expect("second read-only open");

    assert!(matches!(session.open_file(ROOT_INODE, libc::O_RDONLY), Err(EfsError::IsDirectory(_))));
    assert!(matches!(session.open_file(99, libc::O_RDONLY), Err(EfsError::NotFound(99))));
}

fn readdir_snapshot_is_stable() {
    let (_file, mut session) = open_basic(1024);

    for name in [b"a", b"b", b"c"] {
        let ino = session.create_file(ROOT_INODE).expect("create");
        let mut desc = session.read_descriptor(ino).expect("read descriptor");
        desc.name = name.to_vec();
        session.update_descriptor(&desc).expect("set name");
    }
    assert_eq!(session.lookup(ROOT_INODE, b"b").expect("lookup child").file_id, 3);

    let fh = session.open_dir(ROOT_INODE, libc::O_RDONLY).expect("opendir");
    let snapshot: Vec<(u64, Vec<u8>)> = session
        .dir_entries(fh)
        .expect("snapshot")
        .iter()
        .map(|e| (e.ino, e.name.clone()))
        .collect();
    assert_eq!(
        snapshot,
        vec![(2, b"a".to_vec()), (3, b"b".to_vec()), (4, b"c".to_vec())]
    );

    // deleting a child does not disturb the open snapshot
    session.delete_file(3).expect("delete");
    assert_eq!(session.dir_entries(fh).expect("snapshot").len(), 3);
    assert_eq!(session.table().children(ROOT_INODE).count(), 2);

    // resuming from any cursor covers exactly the rest of the snapshot
    let entries = session.dir_entries(fh).expect("snapshot");
    for cursor in 0..=entries.len() {
        let resumed: Vec<u64> = entries.iter().skip(cursor).map(|e| e.ino).collect();
        let expect: Vec<u64> = snapshot.iter().skip(cursor).map(|&(ino, _)| ino).collect();
        assert_eq!(resumed, expect);
    }

    session.release_dir(fh).expect("releasedir");
    assert!(matches!(session.release_dir(fh), Err(EfsError::BadHandle(_))));
}

fn open_expecting_failure(image: Vec<u8>) -> String {
    let file = tempfile::NamedTempFile::new().expect("create temp image");
    std::fs::write(file.path(), image).expect("write image");
    let err = Session::open(file.path()).expect_err("mount must fail");
    format!("{err:#}")
}

fn bad_magic_rejected() {
    let mut image = mkfs::basic(1024).build();
    image[0] ^= 0xff;
    let message = open_expecting_failure(image);
    assert!(message.contains("magic"), "unexpected diagnostic: {message}");
}

fn unsorted_free_list_rejected() {
    let mut fs = mkfs::basic(1024);
    fs.free = vec![Fragment { location: 500, length: 10 }, Fragment { location: 300, length: 10 }];
    let message = open_expecting_failure(fs.build());
    assert!(message.contains("out of order"), "unexpected diagnostic: {message}");
}

/// A fragment pointing outside the image must surface as an error, not
/// as a zero-byte read; the first failing mutation degrades the session.
fn io_errors_are_not_short_reads() {
    let mut fs = mkfs::basic(1024);
    fs.descriptors.push(mkfs::file(
        2,
        ROOT_INODE,
        b"broken",
        4096,
        vec![Fragment { location: 2000, length: 1 }],
    ));
    let file = tempfile::NamedTempFile::new().expect("create temp image");
    fs.write_to(file.path());
    let mut session = Session::open(file.path()).expect("mount image");

    let mut buf = vec![0u8; 16];
    assert!(matches!(session.read_file(2, 0, &mut buf), Err(EfsError::Io(_))));
    assert!(!session.is_degraded());

    assert!(matches!(session.update_file(2, 0, b"x"), Err(EfsError::Io(_))));
    assert!(session.is_degraded());
    assert!(matches!(session.create_file(ROOT_INODE), Err(EfsError::Degraded)));

    // reads continue best-effort after degradation
    assert!(session.getattr(2).is_ok());
}
