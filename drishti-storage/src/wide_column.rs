//! Wide-column metadata store on sled.
//!
//! Everything lives in one table keyed by `(partition, sort key)`:
//!
//! * partition `PRED#<uid>`
//! * sort key `META` for the session record
//! * sort key `DETECT#<label>#<hash>` for each detection, where the hash
//!   covers label, score, box and the detection's sequence number in the
//!   session, so repeated identical findings still get distinct keys
//!
//! A secondary index tree keyed by label serves label queries. Score
//! queries have no index and scan the whole table. That is fine for small
//! deployments and a known bottleneck for large ones.
//!
//! Session writes are upserts: writing the same uid twice keeps the last
//! session record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drishti_core::{
    BoundingBox, Detection, DetectionObject, Error, PredictionSession, Result, SessionSummary,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sled::transaction::{TransactionResult, Transactional};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use crate::metadata_store::{validate_uid, MetadataStore};

const TABLE_TREE: &str = "predictions";
const LABEL_INDEX_TREE: &str = "predictions_by_label";
const META_SORT_KEY: &str = "META";
const DETECT_PREFIX: &str = "DETECT#";
const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Item {
    Meta {
        created_at: DateTime<Utc>,
        original_image: String,
        predicted_image: String,
    },
    Detection {
        seq: u64,
        label: String,
        score: f64,
        bbox: [f64; 4],
    },
}

pub struct WideColumnStore {
    db: sled::Db,
    table: sled::Tree,
    label_index: sled::Tree,
}

impl WideColumnStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| Error::Storage(format!("Sled error: {}", e)))?;
        let store = Self::from_db(db)?;
        info!("Wide-column metadata store opened at {:?}", path.as_ref());
        Ok(store)
    }

    /// Throwaway store backed by a temporary sled directory
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::Storage(format!("Sled error: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let table = db
            .open_tree(TABLE_TREE)
            .map_err(|e| Error::Storage(format!("Sled open_tree error: {}", e)))?;
        let label_index = db
            .open_tree(LABEL_INDEX_TREE)
            .map_err(|e| Error::Storage(format!("Sled open_tree error: {}", e)))?;
        Ok(Self {
            db,
            table,
            label_index,
        })
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|e| Error::Storage(format!("Sled flush error: {}", e)))
    }

    fn load_meta(&self, uid: &str) -> Result<Option<(DateTime<Utc>, String, String)>> {
        let raw = self
            .table
            .get(item_key(uid, META_SORT_KEY))
            .map_err(|e| Error::Storage(format!("Sled get error: {}", e)))?;
        match raw.map(|bytes| decode(&bytes)).transpose()? {
            Some(Item::Meta {
                created_at,
                original_image,
                predicted_image,
            }) => Ok(Some((created_at, original_image, predicted_image))),
            Some(Item::Detection { .. }) => Err(Error::Storage(format!(
                "Corrupt META record for {}",
                uid
            ))),
            None => Ok(None),
        }
    }

    fn next_sequence(&self, uid: &str) -> Result<u64> {
        let mut prefix = partition_prefix(uid);
        prefix.extend_from_slice(DETECT_PREFIX.as_bytes());
        let mut count = 0u64;
        for entry in self.table.scan_prefix(prefix) {
            entry.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            count += 1;
        }
        Ok(count)
    }

    /// Resolve uids to summaries via their META records
    fn summaries(&self, uids: impl IntoIterator<Item = String>) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for uid in uids {
            if let Some((created_at, _, _)) = self.load_meta(&uid)? {
                summaries.push(SessionSummary { uid, created_at });
            }
        }
        Ok(summaries)
    }

    fn write_items(&self, items: Vec<(Vec<u8>, Vec<u8>)>, index_keys: Vec<Vec<u8>>) -> Result<()> {
        let result: TransactionResult<()> =
            (&self.table, &self.label_index).transaction(|(table, index)| {
                for (key, value) in &items {
                    table.insert(key.clone(), value.clone())?;
                }
                for key in &index_keys {
                    index.insert(key.clone(), Vec::<u8>::new())?;
                }
                Ok(())
            });
        result.map_err(|e| Error::Storage(format!("Sled transaction failed: {:?}", e)))
    }
}

fn partition_prefix(uid: &str) -> Vec<u8> {
    let mut key = format!("PRED#{}", uid).into_bytes();
    key.push(KEY_SEPARATOR);
    key
}

fn item_key(uid: &str, sort_key: &str) -> Vec<u8> {
    let mut key = partition_prefix(uid);
    key.extend_from_slice(sort_key.as_bytes());
    key
}

fn index_key(label: &str, uid: &str, sort_key: &str) -> Vec<u8> {
    let mut key = label.as_bytes().to_vec();
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&item_key(uid, sort_key));
    key
}

/// `uid` of an item key (`PRED#<uid>\0<sort key>`)
fn uid_from_item_key(key: &[u8]) -> Option<String> {
    let rest = key.strip_prefix(b"PRED#")?;
    let end = rest.iter().position(|b| *b == KEY_SEPARATOR)?;
    String::from_utf8(rest[..end].to_vec()).ok()
}

fn detection_sort_key(detection: &Detection, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(detection.label.as_bytes());
    hasher.update(detection.score.to_be_bytes());
    for coord in detection.bbox.as_array() {
        hasher.update(coord.to_be_bytes());
    }
    hasher.update(seq.to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}{}#{}", DETECT_PREFIX, detection.label, &digest[..32])
}

fn encode(item: &Item) -> Result<Vec<u8>> {
    bincode::serialize(item).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Item> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn detection_item(uid: &str, detection: &Detection, seq: u64) -> Result<((Vec<u8>, Vec<u8>), Vec<u8>)> {
    let sort_key = detection_sort_key(detection, seq);
    let value = encode(&Item::Detection {
        seq,
        label: detection.label.clone(),
        score: detection.score,
        bbox: detection.bbox.as_array(),
    })?;
    Ok((
        (item_key(uid, &sort_key), value),
        index_key(&detection.label, uid, &sort_key),
    ))
}

#[async_trait]
impl MetadataStore for WideColumnStore {
    fn backend_name(&self) -> &'static str {
        "wide-column"
    }

    fn overwrites_sessions(&self) -> bool {
        true
    }

    async fn save_session(&self, uid: &str, original_ref: &str, predicted_ref: &str) -> Result<()> {
        validate_uid(uid)?;
        let value = encode(&Item::Meta {
            created_at: Utc::now(),
            original_image: original_ref.to_string(),
            predicted_image: predicted_ref.to_string(),
        })?;
        self.table
            .insert(item_key(uid, META_SORT_KEY), value)
            .map_err(|e| Error::Storage(format!("Sled insert error: {}", e)))?;
        self.flush().await
    }

    async fn save_detection(&self, uid: &str, detection: &Detection) -> Result<()> {
        detection.validate()?;
        if self.load_meta(uid)?.is_none() {
            return Err(Error::SessionNotFound(uid.to_string()));
        }

        let seq = self.next_sequence(uid)?;
        let (item, index) = detection_item(uid, detection, seq)?;
        self.write_items(vec![item], vec![index])?;
        self.flush().await
    }

    async fn get_session(&self, uid: &str) -> Result<PredictionSession> {
        let mut meta = None;
        let mut detections = Vec::new();

        for entry in self.table.scan_prefix(partition_prefix(uid)) {
            let (_, value) = entry.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            match decode(&value)? {
                Item::Meta {
                    created_at,
                    original_image,
                    predicted_image,
                } => meta = Some((created_at, original_image, predicted_image)),
                Item::Detection {
                    seq,
                    label,
                    score,
                    bbox,
                } => detections.push((seq, label, score, bbox)),
            }
        }

        let (created_at, original_image_ref, predicted_image_ref) =
            meta.ok_or_else(|| Error::NotFound(format!("Prediction {}", uid)))?;

        // Sort keys order by label; sessions are returned in write order.
        detections.sort_by_key(|(seq, ..)| *seq);
        let detections = detections
            .into_iter()
            .map(|(_, label, score, bbox)| -> Result<DetectionObject> {
                Ok(DetectionObject {
                    prediction_uid: uid.to_string(),
                    label,
                    score,
                    bbox: BoundingBox::try_from(bbox)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PredictionSession {
            uid: uid.to_string(),
            created_at,
            original_image_ref,
            predicted_image_ref,
            detections,
        })
    }

    async fn list_sessions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        let mut prefix = label.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);

        let mut uids = BTreeSet::new();
        for entry in self.label_index.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            if let Some(uid) = uid_from_item_key(&key[prefix.len()..]) {
                uids.insert(uid);
            }
        }
        self.summaries(uids)
    }

    async fn list_sessions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>> {
        // Full table scan: there is no index on score.
        let mut uids = BTreeSet::new();
        let mut scanned = 0usize;
        for entry in self.table.iter() {
            let (key, value) = entry.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            scanned += 1;
            if let Item::Detection { score, .. } = decode(&value)? {
                if score >= min_score {
                    if let Some(uid) = uid_from_item_key(&key) {
                        uids.insert(uid);
                    }
                }
            }
        }
        debug!("Score query scanned {} items, {} sessions matched", scanned, uids.len());
        self.summaries(uids)
    }

    async fn get_predicted_image_ref(&self, uid: &str) -> Result<String> {
        self.load_meta(uid)?
            .map(|(_, _, predicted)| predicted)
            .ok_or_else(|| Error::NotFound(format!("Prediction {}", uid)))
    }

    /// META and every detection go in one sled transaction. Sequence
    /// numbers restart at zero, so re-persisting the same job rewrites the
    /// same keys instead of adding duplicates.
    async fn save_prediction(
        &self,
        uid: &str,
        original_ref: &str,
        predicted_ref: &str,
        detections: &[Detection],
    ) -> Result<()> {
        validate_uid(uid)?;
        for detection in detections {
            detection.validate()?;
        }

        let mut items = vec![(
            item_key(uid, META_SORT_KEY),
            encode(&Item::Meta {
                created_at: Utc::now(),
                original_image: original_ref.to_string(),
                predicted_image: predicted_ref.to_string(),
            })?,
        )];
        let mut index_keys = Vec::with_capacity(detections.len());
        for (seq, detection) in detections.iter().enumerate() {
            let (item, index) = detection_item(uid, detection, seq as u64)?;
            items.push(item);
            index_keys.push(index);
        }

        self.write_items(items, index_keys)?;
        self.flush().await?;
        debug!("Persisted session {} with {} detections", uid, detections.len());
        Ok(())
    }
}
