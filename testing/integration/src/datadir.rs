// File: testing/integration/src/datadir.rs
//
// Per-node data directory layout
//
// <root>/node<i>/
//   node.conf      harness-written config (rewritten on every materialization)
//   stdout.log     node stdout
//   stderr.log     node stderr, compared against the expected value on stop
//   wallets/ chainstate/ blocks/   node-owned state, the only entries kept in the cache

use crate::config::PortAllocator;
use crate::error::{HarnessResult, IoResultExt};
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Config file written into every datadir
pub const CONF_FILE: &str = "node.conf";

/// File receiving node stdout
pub const STDOUT_FILE: &str = "stdout.log";

/// File receiving node stderr
pub const STDERR_FILE: &str = "stderr.log";

/// Datadir entries that survive cache pruning
pub const CACHE_RETAINED_ENTRIES: [&str; 3] = ["wallets", "chainstate", "blocks"];

/// Path of node `n`'s datadir under `root`
pub fn datadir_path(root: &Path, n: usize) -> PathBuf {
    root.join(format!("node{n}"))
}

/// Base config for node `n`, before any overrides are applied
pub fn base_conf(n: usize, ports: &PortAllocator, bind_host: &str) -> IndexMap<String, String> {
    let mut conf = IndexMap::new();
    conf.insert("network".to_string(), "\"devnet\"".to_string());
    conf.insert(
        "p2p_bind_address".to_string(),
        format!("\"{bind_host}:{}\"", ports.p2p_port(n)),
    );
    conf.insert(
        "rpc_bind_address".to_string(),
        format!("\"{bind_host}:{}\"", ports.rpc_port(n)),
    );
    conf.insert("log_level".to_string(), "\"info\"".to_string());
    conf.insert("disable_file_log".to_string(), "false".to_string());
    conf
}

/// Render a config map as `key = value` lines
pub fn render_conf(conf: &IndexMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in conf {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Create (if needed) node `n`'s datadir and (re)write its config.
///
/// Overrides are layered on top of the base config, so per-test values such
/// as ports or log level always win over whatever a cached copy carried.
pub fn initialize_datadir(
    root: &Path,
    n: usize,
    ports: &PortAllocator,
    bind_host: &str,
    overrides: &IndexMap<String, String>,
) -> HarnessResult<PathBuf> {
    let datadir = datadir_path(root, n);
    fs::create_dir_all(&datadir).with_path(&datadir)?;

    let mut conf = base_conf(n, ports, bind_host);
    for (key, value) in overrides {
        conf.insert(key.clone(), value.clone());
    }

    let conf_path = datadir.join(CONF_FILE);
    fs::write(&conf_path, render_conf(&conf)).with_path(&conf_path)?;

    if log::log_enabled!(log::Level::Debug) {
        log::debug!("Initialized datadir {:?}", datadir);
    }
    Ok(datadir)
}

/// Parse a config file written by `render_conf`
pub fn read_conf(path: &Path) -> HarnessResult<IndexMap<String, String>> {
    let content = fs::read_to_string(path).with_path(path)?;
    let mut conf = IndexMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            conf.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(conf)
}

/// Recursively copy `from` into `to` (which must not exist yet)
pub fn copy_tree(from: &Path, to: &Path) -> HarnessResult<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| from.to_path_buf());
            crate::error::HarnessError::io(path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| anyhow::anyhow!("walked outside {:?}: {e}", from))?;
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).with_path(&target)?;
        } else {
            fs::copy(entry.path(), &target).with_path(&target)?;
        }
    }
    Ok(())
}

/// Delete every top-level entry of `datadir` not listed in `retained`
pub fn prune_datadir(datadir: &Path, retained: &[&str]) -> HarnessResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(datadir).with_path(datadir)? {
        let entry = entry.with_path(datadir)?;
        let name = entry.file_name();
        if retained.iter().any(|keep| name.as_os_str() == *keep) {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type().with_path(&path)?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path).with_path(&path)?;
        } else {
            fs::remove_file(&path).with_path(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}
