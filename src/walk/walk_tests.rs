#![allow(clippy::unwrap_used)]

use crate::error::{EntryErrorKind, WalkError};
use crate::fs::FileType;
use crate::walk::{
    LinkMode, SortOrder, Visit, WalkAction, WalkBuilder, WalkOutcome,
};
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{PermissionsExt as _, symlink};
use std::path::PathBuf;

#[derive(Debug, Clone)]
struct Rec {
    path: PathBuf,
    name: std::ffi::OsString,
    depth: u32,
    file_type: FileType,
    is_loop: bool,
    error: Option<EntryErrorKind>,
}

impl Rec {
    fn capture(visit: &Visit<'_>) -> Self {
        Self {
            path: visit.path().to_path_buf(),
            name: visit.file_name().to_owned(),
            depth: visit.depth(),
            file_type: visit.file_type(),
            is_loop: visit.is_loop(),
            error: visit.error().map(|e| e.kind),
        }
    }
}

fn collect(builder: WalkBuilder) -> (Vec<Rec>, WalkOutcome) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut records = Vec::new();
    let outcome = builder
        .walk(|visit| {
            records.push(Rec::capture(visit));
            WalkAction::Continue
        })
        .unwrap();
    (records, outcome)
}

/// Small mixed fixture: {a, b, c/d, e/f, g/h, i} under the root, i empty.
fn basic_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("a"), "a").unwrap();
    fs::write(root.join("b"), "b").unwrap();
    for (parent, child) in [("c", "d"), ("e", "f"), ("g", "h")] {
        fs::create_dir(root.join(parent)).unwrap();
        fs::write(root.join(parent).join(child), child).unwrap();
    }
    fs::create_dir(root.join("i")).unwrap();
    dir
}

fn assert_bfs_order(records: &[Rec]) {
    for pair in records.windows(2) {
        assert!(
            pair[0].depth <= pair[1].depth,
            "depth went backwards: {:?} then {:?}",
            pair[0].path,
            pair[1].path
        );
    }
}

fn assert_single_delivery(records: &[Rec]) {
    let mut seen = HashSet::new();
    for rec in records {
        assert!(
            seen.insert(rec.path.clone()),
            "duplicate record for {:?}",
            rec.path
        );
    }
}

#[cfg(target_os = "linux")]
fn open_fd_count() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

/// Concurrent tests open and close their own descriptors, so give the
/// process a moment to settle before declaring a leak.
#[cfg(target_os = "linux")]
fn assert_fd_count_settles_to(baseline: usize) {
    for _ in 0..50 {
        if open_fd_count() == baseline {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert_eq!(open_fd_count(), baseline, "engine-attributable fds leaked");
}

#[test]
fn basic_tree_emits_ten_records_in_bfs_order() {
    let dir = basic_tree();
    let (records, outcome) = collect(WalkBuilder::new(dir.path()).sort(SortOrder::Ascending));

    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(records.len(), 10);
    assert_bfs_order(&records);
    assert_single_delivery(&records);
    assert!(records.iter().all(|r| r.error.is_none() && !r.is_loop));

    assert_eq!(records[0].depth, 0);
    assert_eq!(records[0].path, dir.path());

    let level1: Vec<_> = records
        .iter()
        .filter(|r| r.depth == 1)
        .map(|r| r.name.clone())
        .collect();
    // sorted order within the single parent
    assert_eq!(level1, ["a", "b", "c", "e", "g", "i"]);

    let mut level2: Vec<_> = records
        .iter()
        .filter(|r| r.depth == 2)
        .map(|r| r.name.clone())
        .collect();
    level2.sort();
    assert_eq!(level2, ["d", "f", "h"]);

    for rec in &records {
        let expect_dir = matches!(
            rec.name.to_str().unwrap(),
            "c" | "e" | "g" | "i"
        ) || rec.depth == 0;
        assert_eq!(rec.file_type.is_dir(), expect_dir, "{:?}", rec.path);
    }
}

#[test]
fn readdir_order_is_preserved_without_sort() {
    let dir = basic_tree();
    let (records, _) = collect(WalkBuilder::new(dir.path()));
    assert_eq!(records.len(), 10);
    assert_bfs_order(&records);
    assert_single_delivery(&records);
}

#[test]
fn descending_sort_reverses_siblings() {
    let dir = basic_tree();
    let (records, _) = collect(WalkBuilder::new(dir.path()).sort(SortOrder::Descending));
    let level1: Vec<_> = records
        .iter()
        .filter(|r| r.depth == 1)
        .map(|r| r.name.clone())
        .collect();
    assert_eq!(level1, ["i", "g", "e", "c", "b", "a"]);
}

#[test]
fn self_link_is_flagged_as_loop_and_not_descended() {
    let dir = tempfile::tempdir().unwrap();
    symlink(dir.path(), dir.path().join("link")).unwrap();

    let (records, outcome) =
        collect(WalkBuilder::new(dir.path()).link_mode(LinkMode::Always));

    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].depth, 0);
    assert!(!records[0].is_loop);
    assert_eq!(records[1].depth, 1);
    assert!(records[1].is_loop, "cycle back to the root must be flagged");
    assert!(records[1].error.is_none(), "a loop is not an error");
}

#[test]
fn deeper_cycle_through_two_links_terminates() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    symlink(dir.path(), dir.path().join("sub").join("up")).unwrap();

    let (records, outcome) =
        collect(WalkBuilder::new(dir.path()).link_mode(LinkMode::Always));

    assert_eq!(outcome, WalkOutcome::Finished);
    let looped: Vec<_> = records.iter().filter(|r| r.is_loop).collect();
    assert_eq!(looped.len(), 1);
    assert!(looped[0].path.ends_with("sub/up"));
    assert_single_delivery(&records);
}

#[test]
fn denied_directory_yields_synthetic_error_record() {
    if unsafe { libc::geteuid() } == 0 {
        // root ignores permission bits; nothing to observe
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("readable")).unwrap();
    fs::write(dir.path().join("readable").join("ok"), "").unwrap();
    fs::create_dir(dir.path().join("denied")).unwrap();
    fs::set_permissions(dir.path().join("denied"), fs::Permissions::from_mode(0)).unwrap();

    let (records, outcome) = collect(WalkBuilder::new(dir.path()));
    fs::set_permissions(dir.path().join("denied"), fs::Permissions::from_mode(0o755)).unwrap();

    assert_eq!(outcome, WalkOutcome::Finished);

    // both children emitted normally, then the failed descent reports
    let normal: Vec<_> = records.iter().filter(|r| r.error.is_none()).collect();
    assert_eq!(normal.len(), 4); // root, readable, denied, readable/ok

    let errors: Vec<_> = records.iter().filter(|r| r.error.is_some()).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error, Some(EntryErrorKind::OpenDenied));
    assert_eq!(errors[0].file_type, FileType::Error);
    assert!(errors[0].path.ends_with("denied"));
    assert!(
        records
            .iter()
            .any(|r| r.path.ends_with("readable/ok") && r.error.is_none()),
        "children of readable siblings are unaffected"
    );
}

#[test]
fn stop_halts_after_exactly_ten_visits() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..40 {
        fs::create_dir(dir.path().join(format!("d{i:02}"))).unwrap();
        for j in 0..3 {
            fs::write(dir.path().join(format!("d{i:02}")).join(format!("f{j}")), "").unwrap();
        }
    }

    #[cfg(target_os = "linux")]
    let fds_before = open_fd_count();

    let mut visits = 0;
    let outcome = WalkBuilder::new(dir.path())
        .walk(|_visit| {
            visits += 1;
            if visits == 10 {
                WalkAction::Stop
            } else {
                WalkAction::Continue
            }
        })
        .unwrap();

    assert_eq!(outcome, WalkOutcome::Stopped);
    assert_eq!(visits, 10, "no callback runs after Stop");

    #[cfg(target_os = "linux")]
    assert_fd_count_settles_to(fds_before);
}

#[test]
fn fail_surfaces_the_callback_reason() {
    let dir = basic_tree();
    let result = WalkBuilder::new(dir.path()).walk(|visit| {
        if visit.depth() == 1 {
            WalkAction::Fail(std::io::Error::other("budget exceeded"))
        } else {
            WalkAction::Continue
        }
    });

    match result {
        Err(WalkError::Callback(reason)) => {
            assert_eq!(reason.to_string(), "budget exceeded");
        }
        other => panic!("expected a callback failure, got {other:?}"),
    }
}

#[test]
fn prune_skips_a_subtree_but_nothing_else() {
    let dir = basic_tree();
    let mut records = Vec::new();
    let outcome = WalkBuilder::new(dir.path())
        .sort(SortOrder::Ascending)
        .walk(|visit| {
            records.push(Rec::capture(visit));
            if visit.file_name() == "c" {
                WalkAction::Prune
            } else {
                WalkAction::Continue
            }
        })
        .unwrap();

    assert_eq!(outcome, WalkOutcome::Finished);
    assert!(records.iter().any(|r| r.name == "c"), "pruned dir is still emitted");
    assert!(
        !records.iter().any(|r| r.name == "d"),
        "nothing under the pruned dir is emitted"
    );
    assert!(records.iter().any(|r| r.name == "f"));
    assert!(records.iter().any(|r| r.name == "h"));
}

#[test]
fn depth_window_filters_emission_and_caps_descent() {
    let dir = basic_tree();

    let (only_mid, _) = collect(
        WalkBuilder::new(dir.path())
            .min_depth(1)
            .max_depth(1)
            .sort(SortOrder::Ascending),
    );
    assert!(only_mid.iter().all(|r| r.depth == 1));
    assert_eq!(only_mid.len(), 6);

    let (deep_only, _) = collect(WalkBuilder::new(dir.path()).min_depth(2));
    assert!(deep_only.iter().all(|r| r.depth == 2));
    assert_eq!(deep_only.len(), 3, "descent through unemitted levels still works");

    let (shallow, _) = collect(WalkBuilder::new(dir.path()).max_depth(0));
    assert_eq!(shallow.len(), 1, "max_depth 0 emits just the root");
}

#[test]
fn broken_symlink_stays_a_link_entry() {
    let dir = tempfile::tempdir().unwrap();
    symlink("nowhere", dir.path().join("dangling")).unwrap();

    // not following: it is just a link
    let (records, _) = collect(WalkBuilder::new(dir.path()));
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].file_type, FileType::Symlink);
    assert!(records[1].error.is_none());

    // following: the unresolvable target degrades it back to a link, no error
    let (records, _) = collect(WalkBuilder::new(dir.path()).link_mode(LinkMode::Always));
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].file_type, FileType::Symlink);
    assert!(records[1].error.is_none());
}

#[test]
fn strict_mode_reports_broken_link_targets() {
    let dir = tempfile::tempdir().unwrap();
    symlink("nowhere", dir.path().join("dangling")).unwrap();

    // following strictly: the dangling target is an error on the record
    let (records, outcome) = collect(
        WalkBuilder::new(dir.path())
            .link_mode(LinkMode::Always)
            .strict_links(true),
    );
    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].file_type, FileType::Symlink);
    assert_eq!(records[1].error, Some(EntryErrorKind::BrokenLink));

    // target stats alone honor strictness the same way
    let (records, _) = collect(
        WalkBuilder::new(dir.path())
            .need_target_stat(true)
            .strict_links(true),
    );
    assert_eq!(records[1].error, Some(EntryErrorKind::BrokenLink));

    // a dangling root link strictly followed is a broken-link error record
    let (records, _) = collect(
        WalkBuilder::new(dir.path().join("dangling"))
            .link_mode(LinkMode::Always)
            .strict_links(true),
    );
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_type, FileType::Error);
    assert_eq!(records[0].error, Some(EntryErrorKind::BrokenLink));

    // a healthy link is untouched by strictness
    fs::write(dir.path().join("real"), "").unwrap();
    symlink(dir.path().join("real"), dir.path().join("ok")).unwrap();
    let (records, _) = collect(
        WalkBuilder::new(dir.path())
            .need_target_stat(true)
            .strict_links(true)
            .sort(SortOrder::Ascending),
    );
    let ok_rec = records.iter().find(|r| r.name == "ok").unwrap();
    assert!(ok_rec.error.is_none());
}

#[test]
fn symlinked_root_follows_per_mode() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("real")).unwrap();
    fs::write(dir.path().join("real").join("inner"), "").unwrap();
    let alias = dir.path().join("alias");
    symlink(dir.path().join("real"), &alias).unwrap();

    // never: the root is a symlink leaf
    let (records, _) = collect(WalkBuilder::new(&alias));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_type, FileType::Symlink);

    // roots-only: followed exactly once, children visited, no deeper follow
    let (records, _) = collect(WalkBuilder::new(&alias).link_mode(LinkMode::RootsOnly));
    assert_eq!(records.len(), 2);
    assert!(records[0].file_type.is_dir());
    assert_eq!(records[1].name, "inner");
    assert_eq!(records[1].depth, 1);
}

#[test]
fn multiple_roots_walk_in_order_with_level_interleaving() {
    let one = basic_tree();
    let two = tempfile::tempdir().unwrap();
    fs::write(two.path().join("only"), "").unwrap();

    let (records, outcome) = collect(
        WalkBuilder::new(one.path())
            .add_root(two.path())
            .sort(SortOrder::Ascending),
    );

    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(records.len(), 12);
    assert_bfs_order(&records);
    // both roots lead level 0, in the order given
    assert_eq!(records[0].path, one.path());
    assert_eq!(records[1].path, two.path());
    assert!(records.iter().any(|r| r.name == "only" && r.depth == 1));
}

#[test]
fn need_stat_populates_every_record() {
    let dir = basic_tree();
    let mut checked = 0;
    WalkBuilder::new(dir.path())
        .need_stat(true)
        .walk(|visit| {
            let stat = visit.stat().expect("need_stat guarantees a snapshot");
            assert!(stat.identity().is_some());
            if visit.depth() > 0 {
                // the accessor must agree with the snapshot
                let borrowed = visit.at_fd().expect("children carry a parent fd");
                use std::os::fd::AsRawFd as _;
                let through_at = crate::fs::stat_at(
                    borrowed.as_raw_fd(),
                    &std::ffi::CString::new(
                        visit.at_path().as_encoded_bytes().to_vec(),
                    )
                    .unwrap(),
                    crate::fs::StatFlags::NO_FOLLOW,
                    crate::fs::StatField::BASIC,
                )
                .unwrap();
                assert_eq!(through_at.identity(), stat.identity());
            }
            checked += 1;
            WalkAction::Continue
        })
        .unwrap();
    assert_eq!(checked, 10);
}

#[test]
fn target_stat_rides_along_for_links() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("real"), "payload").unwrap();
    symlink(dir.path().join("real"), dir.path().join("ref")).unwrap();

    let mut saw_link = false;
    WalkBuilder::new(dir.path())
        .need_target_stat(true)
        .walk(|visit| {
            if visit.file_name() == "ref" {
                saw_link = true;
                assert_eq!(visit.file_type(), FileType::Symlink);
                let target = visit.target_stat().expect("target stat was requested");
                assert_eq!(target.size(), Some(7));
            }
            WalkAction::Continue
        })
        .unwrap();
    assert!(saw_link);
}

#[test]
fn no_fd_leaks_across_a_full_walk() {
    #[cfg(target_os = "linux")]
    {
        let dir = basic_tree();
        let before = open_fd_count();
        let (records, _) = collect(WalkBuilder::new(dir.path()));
        assert_eq!(records.len(), 10);
        assert_fd_count_settles_to(before);
    }
}

#[test]
fn randomized_tree_is_covered_completely() {
    use rand::RngExt as _;

    let dir = tempfile::tempdir().unwrap();
    let mut rng = rand::rng();
    let mut expected = HashSet::new();
    expected.insert(dir.path().to_path_buf());

    let mut dirs = vec![dir.path().to_path_buf()];
    for i in 0..120 {
        let parent = dirs[rng.random_range(0..dirs.len())].clone();
        let path = parent.join(format!("n{i}"));
        if rng.random_bool(0.35) {
            fs::create_dir(&path).unwrap();
            dirs.push(path.clone());
        } else {
            fs::write(&path, "x").unwrap();
        }
        expected.insert(path);
    }

    let (records, outcome) = collect(WalkBuilder::new(dir.path()));
    assert_eq!(outcome, WalkOutcome::Finished);
    assert_bfs_order(&records);
    assert_single_delivery(&records);

    let walked: HashSet<_> = records.iter().map(|r| r.path.clone()).collect();
    assert_eq!(walked, expected, "every entry present at start is visited once");
}

/// 20 components of 255 bytes each: deeper than PATH_MAX once joined,
/// and every name sits at the component-length limit.
#[test]
#[cfg(target_os = "linux")]
fn tree_deeper_than_path_max() {
    use std::os::unix::ffi::OsStrExt as _;

    let dir = tempfile::tempdir().unwrap();
    let name = "x".repeat(255);
    let name_c = std::ffi::CString::new(name.as_str()).unwrap();

    let mut fd = unsafe {
        libc::open(
            std::ffi::CString::new(dir.path().as_os_str().as_bytes())
                .unwrap()
                .as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    assert!(fd >= 0);
    const LEVELS: u32 = 20;
    for _ in 0..LEVELS {
        assert_eq!(unsafe { libc::mkdirat(fd, name_c.as_ptr(), 0o755) }, 0);
        let next = unsafe {
            libc::openat(
                fd,
                name_c.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        assert!(next >= 0);
        unsafe { libc::close(fd) };
        fd = next;
    }
    unsafe { libc::close(fd) };

    let (records, outcome) = collect(WalkBuilder::new(dir.path()));
    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(records.len() as u32, LEVELS + 1);
    assert_bfs_order(&records);
    let deepest = records.iter().map(|r| r.depth).max().unwrap();
    assert_eq!(deepest, LEVELS);
    assert!(records.iter().all(|r| r.error.is_none()));

    let longest = records
        .iter()
        .map(|r| r.path.as_os_str().len())
        .max()
        .unwrap();
    assert!(
        longest > libc::PATH_MAX as usize,
        "the fixture really does exceed PATH_MAX"
    );
}

/// Clobber the directory stream's descriptor with a regular file after the
/// first batch of children has been decoded: the next `getdents` fails
/// mid-stream, the already-decoded siblings still go out in order, and one
/// synthetic record reports the failure at the directory's level.
#[test]
#[cfg(target_os = "linux")]
fn mid_stream_readdir_failure_keeps_partial_children_then_reports() {
    use std::os::fd::AsRawFd as _;

    let dir = tempfile::tempdir().unwrap();
    // long names so the fixture spans several 32 KiB getdents batches
    let total = 500;
    let pad = "p".repeat(200);
    for i in 0..total {
        fs::write(dir.path().join(format!("{pad}{i:04}")), "").unwrap();
    }
    let decoy = tempfile::NamedTempFile::new().unwrap();
    let decoy_fd = decoy.as_file().as_raw_fd();

    let mut sabotaged = false;
    let mut children = 0usize;
    let mut failures = Vec::new();
    let mut emitted = 0usize;
    let mut failure_at = None;
    WalkBuilder::new(dir.path())
        .walk(|visit| {
            if let Some(entry_err) = visit.error() {
                failures.push(entry_err.kind);
                failure_at = Some(emitted);
                assert_eq!(visit.path(), dir.path());
                assert_eq!(visit.file_type(), FileType::Error);
            } else if visit.depth() == 1 {
                children += 1;
                if !sabotaged {
                    sabotaged = true;
                    let at = visit.at_fd().expect("children carry the stream fd");
                    let rc = unsafe { libc::dup2(decoy_fd, at.as_raw_fd()) };
                    assert!(rc >= 0);
                }
            }
            emitted += 1;
            WalkAction::Continue
        })
        .unwrap();

    assert_eq!(failures, [EntryErrorKind::ReaddirFailed]);
    assert!(children >= 1, "the first batch was already decoded");
    assert!(children < total, "batches after the failure are lost");
    assert_eq!(
        failure_at,
        Some(emitted - 1),
        "the error record follows the partial children"
    );
}

#[test]
fn overlong_root_component_is_name_too_long() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("y".repeat(300));

    let (records, outcome) = collect(WalkBuilder::new(&root));
    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_type, FileType::Error);
    assert_eq!(records[0].error, Some(EntryErrorKind::NameTooLong));
}

#[test]
fn empty_and_single_entry_directories() {
    let dir = tempfile::tempdir().unwrap();
    let (records, _) = collect(WalkBuilder::new(dir.path()));
    assert_eq!(records.len(), 1, "an empty root is just itself");

    fs::write(dir.path().join("lone"), "").unwrap();
    let (records, _) = collect(WalkBuilder::new(dir.path()));
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].name, "lone");
}

#[test]
fn visit_exposes_name_offset_and_root() {
    let dir = basic_tree();
    WalkBuilder::new(dir.path())
        .walk(|visit| {
            assert_eq!(visit.root(), dir.path());
            let bytes = visit.path().as_os_str().as_encoded_bytes();
            assert_eq!(
                &bytes[visit.name_offset()..],
                visit.file_name().as_encoded_bytes()
            );
            WalkAction::Continue
        })
        .unwrap();
}
