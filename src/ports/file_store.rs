use std::fs;
use std::path::PathBuf;

use crate::journal::OrderLogEntry;
use crate::position::Position;

/// Wholesale JSON snapshots of the managed set and the order log: read once
/// at startup, overwritten after each tick. Writes go through a temp file
/// and rename so a crash mid-write never leaves a torn snapshot behind.
pub struct SnapshotStore {
    positions_path: PathBuf,
    orders_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(positions_path: impl Into<PathBuf>, orders_path: impl Into<PathBuf>) -> Self {
        Self {
            positions_path: positions_path.into(),
            orders_path: orders_path.into(),
        }
    }

    pub fn load_positions(&self) -> Option<Vec<Position>> {
        let content = fs::read_to_string(&self.positions_path).ok()?;
        match serde_json::from_str(&content) {
            Ok(positions) => Some(positions),
            Err(err) => {
                log::warn!(
                    "[SNAPSHOT] failed to parse {}: {:?}",
                    self.positions_path.display(),
                    err
                );
                None
            }
        }
    }

    pub fn load_orders(&self) -> Option<Vec<OrderLogEntry>> {
        let content = fs::read_to_string(&self.orders_path).ok()?;
        match serde_json::from_str(&content) {
            Ok(orders) => Some(orders),
            Err(err) => {
                log::warn!(
                    "[SNAPSHOT] failed to parse {}: {:?}",
                    self.orders_path.display(),
                    err
                );
                None
            }
        }
    }

    pub fn save_positions(&self, positions: &[Position]) {
        Self::write_json(&self.positions_path, positions);
    }

    pub fn save_orders(&self, orders: &[OrderLogEntry]) {
        Self::write_json(&self.orders_path, orders);
    }

    fn write_json<T: serde::Serialize + ?Sized>(path: &PathBuf, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("[SNAPSHOT] failed to encode {}: {:?}", path.display(), err);
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(err) = fs::create_dir_all(parent) {
                    log::warn!("[SNAPSHOT] failed to create {}: {:?}", parent.display(), err);
                    return;
                }
            }
        }
        let tmp_path = path.with_extension("json.tmp");
        if let Err(err) = fs::write(&tmp_path, payload) {
            log::warn!("[SNAPSHOT] failed to write {}: {:?}", tmp_path.display(), err);
            return;
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            log::warn!("[SNAPSHOT] failed to finalize {}: {:?}", path.display(), err);
        }
    }
}
