use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use git_mirror_cache::{
    CancelToken, GitRemote, Kind, Migration, ObjectCache, ObjectId, SyncOptions,
};
use tempfile::TempDir;

/// Helper to run git commands in a directory
fn git_command(dir: &Path, args: &[&str]) -> std::process::Output {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("Failed to run git command");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    String::from_utf8_lossy(&git_command(dir, args).stdout)
        .trim()
        .to_string()
}

fn rev(dir: &Path, name: &str) -> ObjectId {
    ObjectId::from_hex(&git_stdout(dir, &["rev-parse", name])).unwrap()
}

fn commit_file(repo: &Path, name: &str, content: &str, message: &str) {
    fs::write(repo.join(name), content).unwrap();
    git_command(repo, &["add", "."]);
    git_command(repo, &["commit", "-q", "-m", message]);
}

/// Create an empty repository with a fixed identity
fn init_repo(dir: &Path) -> PathBuf {
    let repo_dir = dir.join("test-repo");
    fs::create_dir(&repo_dir).expect("Failed to create repo dir");

    git_command(&repo_dir, &["init", "-q"]);
    git_command(&repo_dir, &["config", "user.name", "Test User"]);
    git_command(&repo_dir, &["config", "user.email", "test@example.com"]);
    git_command(&repo_dir, &["config", "commit.gpgsign", "false"]);
    git_command(&repo_dir, &["config", "tag.gpgsign", "false"]);
    git_command(&repo_dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    repo_dir
}

fn sync(cache: &mut ObjectCache, repo: &Path) -> git_mirror_cache::SyncReport {
    let mut remote = GitRemote::new(repo);
    cache
        .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
        .expect("sync failed")
}

#[test]
fn test_root_commit_round_trip() {
    let temp = TempDir::new().unwrap();
    let repo = init_repo(temp.path());
    commit_file(&repo, "file1.txt", "content 1\n", "Initial commit");

    let mut cache = ObjectCache::open(temp.path().join("cache.db")).unwrap();
    let report = sync(&mut cache, &repo);
    assert_eq!(report.objects_inserted, 2, "commit and tree, no blob");
    assert_eq!(report.commits_indexed, 1);
    assert!(report.index_failures.is_empty());

    let head = rev(&repo, "HEAD");
    assert_eq!(cache.resolve("HEAD").unwrap(), head);
    assert_eq!(cache.resolve("main").unwrap(), head);

    let info = cache.stat(&head).unwrap();
    assert_eq!(info.kind, Kind::Commit);
    let size: u64 = git_stdout(&repo, &["cat-file", "-s", "HEAD"]).parse().unwrap();
    assert_eq!(info.size, size);

    let expected = git_command(&repo, &["cat-file", "commit", "HEAD"]).stdout;
    let mut actual = Vec::new();
    cache
        .open_object(&head)
        .unwrap()
        .read_to_end(&mut actual)
        .unwrap();
    assert_eq!(actual, expected);

    let record = cache.commit(&head).unwrap();
    assert_eq!(record.tree, rev(&repo, "HEAD^{tree}"));
    assert!(record.parents.is_empty());
    assert_eq!(record.author.ident, "Test User <test@example.com>");
    assert_eq!(record.message, "Initial commit\n");
    assert!(!cache.contains(&rev(&repo, "HEAD:file1.txt")).unwrap());

    let again = sync(&mut cache, &repo);
    assert_eq!(again.objects_inserted, 0);
    assert_eq!(again.commits_indexed, 0);
}

#[test]
fn test_history_with_merge() {
    let temp = TempDir::new().unwrap();
    let repo = init_repo(temp.path());
    commit_file(&repo, "file1.txt", "content 1\n", "Initial commit");
    git_command(&repo, &["checkout", "-q", "-b", "topic"]);
    commit_file(&repo, "file2.txt", "content 2\n", "Topic work");
    git_command(&repo, &["checkout", "-q", "main"]);
    commit_file(&repo, "file1.txt", "content 1, revised\n", "Mainline work");
    git_command(&repo, &["merge", "-q", "--no-ff", "-m", "Merge topic", "topic"]);

    let mut cache = ObjectCache::open_in_memory().unwrap();
    let report = sync(&mut cache, &repo);

    let total: usize = git_stdout(&repo, &["rev-list", "--count", "--all"])
        .parse()
        .unwrap();
    assert_eq!(report.commits_indexed, total);
    assert_eq!(cache.commit_count().unwrap(), total as u64);

    let merge = cache.commit(&rev(&repo, "HEAD")).unwrap();
    assert_eq!(
        merge.parents,
        vec![rev(&repo, "HEAD^1"), rev(&repo, "HEAD^2")]
    );
    assert_eq!(cache.resolve("topic").unwrap(), rev(&repo, "topic"));
}

#[test]
fn test_incremental_sync_and_tags() {
    let temp = TempDir::new().unwrap();
    let repo = init_repo(temp.path());
    commit_file(&repo, "file1.txt", "content 1\n", "Initial commit");

    let mut cache = ObjectCache::open_in_memory().unwrap();
    sync(&mut cache, &repo);

    commit_file(&repo, "file1.txt", "content 1\ncontent 2\n", "Second commit");
    git_command(&repo, &["tag", "-a", "v1.0", "-m", "Release 1.0"]);
    let report = sync(&mut cache, &repo);
    assert_eq!(report.commits_indexed, 1);
    assert_eq!(report.tags_indexed, 1);

    let tag = cache.resolve("v1.0").unwrap();
    assert_eq!(tag, rev(&repo, "v1.0"));
    assert_eq!(cache.stat(&tag).unwrap().kind, Kind::Tag);
    assert_eq!(cache.peel(&tag).unwrap(), rev(&repo, "HEAD"));

    let second = cache.commit(&rev(&repo, "HEAD")).unwrap();
    assert_eq!(second.parents, vec![rev(&repo, "HEAD~1")]);
}

#[test]
fn test_cache_file_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let repo = init_repo(temp.path());
    commit_file(&repo, "file1.txt", "content 1\n", "Initial commit");
    let path = temp.path().join("cache.db");

    let mut cache = ObjectCache::open(&path).unwrap();
    assert_eq!(cache.migration(), Migration::Created);
    sync(&mut cache, &repo);
    let objects = cache.object_count().unwrap();
    cache.close().unwrap();

    let cache = ObjectCache::open(&path).unwrap();
    assert_eq!(cache.migration(), Migration::Current);
    assert_eq!(cache.object_count().unwrap(), objects);
    assert_eq!(cache.resolve("main").unwrap(), rev(&repo, "HEAD"));
}

#[test]
fn test_empty_repository_syncs_nothing() {
    let temp = TempDir::new().unwrap();
    let repo = init_repo(temp.path());

    let mut cache = ObjectCache::open_in_memory().unwrap();
    let report = sync(&mut cache, &repo);
    assert_eq!(report.refs, 0);
    assert_eq!(report.wanted, 0);
    assert_eq!(cache.object_count().unwrap(), 0);
}
