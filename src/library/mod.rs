//! Library ingestion: walking an image source into the face store.

pub mod hashing;
pub mod source;

pub use source::{DirSource, ImageSource};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Result;

use crate::db::{FaceStore, IngestOutcome, NewFaceRecord, StoreError};
use crate::extract::EmbeddingExtractor;

/// What happened to one listed image.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Inserted { faces: usize },
    SkippedExisting,
    SkippedDuplicate,
    NoFaces,
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub enum LoadProgress {
    Started { total: usize },
    Processed { current: usize, total: usize, path: String },
    Error { message: String },
    Cancelled { processed: usize, total: usize },
    Completed { report: LoadReport },
}

/// Tally of one ingestion run. `inserted` counts face records, the
/// other counters count images.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub total: usize,
    pub processed: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub skipped_duplicate: usize,
    pub no_faces: usize,
    pub failed: usize,
}

/// Feeds a face store from an image source, one image at a time.
///
/// Every candidate face goes through the store's duplicate-checked
/// insert, so re-running a load over the same library is a no-op.
pub struct LibraryLoader {
    source: Arc<dyn ImageSource>,
    extractor: Arc<dyn EmbeddingExtractor>,
    duplicate_threshold: f32,
}

impl LibraryLoader {
    pub fn new(
        source: Arc<dyn ImageSource>,
        extractor: Arc<dyn EmbeddingExtractor>,
        duplicate_threshold: f32,
    ) -> Self {
        Self {
            source,
            extractor,
            duplicate_threshold,
        }
    }

    pub fn load_library(
        &self,
        store: &FaceStore,
        library: &str,
        progress_tx: Option<mpsc::Sender<LoadProgress>>,
    ) -> Result<LoadReport> {
        let cancel = AtomicBool::new(false);
        self.load_library_cancellable(store, library, progress_tx, &cancel)
    }

    /// Run one ingestion pass over `library`.
    ///
    /// Per-image failures are reported and skipped; store failures abort
    /// the run. The cancel flag is checked between images, so flipping it
    /// stops the run at the next boundary with the store fully valid.
    pub fn load_library_cancellable(
        &self,
        store: &FaceStore,
        library: &str,
        progress_tx: Option<mpsc::Sender<LoadProgress>>,
        cancel: &AtomicBool,
    ) -> Result<LoadReport> {
        let identifiers = self.source.list(library)?;

        let total = identifiers.len();
        let mut report = LoadReport {
            total,
            ..Default::default()
        };

        tracing::info!(library, total, "loading image library");
        if let Some(ref tx) = progress_tx {
            let _ = tx.send(LoadProgress::Started { total });
        }

        for (index, identifier) in identifiers.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(processed = report.processed, total, "library load cancelled");
                if let Some(ref tx) = progress_tx {
                    let _ = tx.send(LoadProgress::Cancelled {
                        processed: report.processed,
                        total,
                    });
                }
                return Ok(report);
            }

            match self.process_one(store, identifier)? {
                ItemOutcome::Inserted { faces } => report.inserted += faces,
                ItemOutcome::SkippedExisting => report.skipped_existing += 1,
                ItemOutcome::SkippedDuplicate => report.skipped_duplicate += 1,
                ItemOutcome::NoFaces => report.no_faces += 1,
                ItemOutcome::Failed { message } => {
                    report.failed += 1;
                    tracing::warn!(path = %identifier, error = %message, "failed to ingest image");
                    if let Some(ref tx) = progress_tx {
                        let _ = tx.send(LoadProgress::Error {
                            message: format!("{identifier}: {message}"),
                        });
                    }
                }
            }

            report.processed = index + 1;
            if let Some(ref tx) = progress_tx {
                let _ = tx.send(LoadProgress::Processed {
                    current: report.processed,
                    total,
                    path: identifier.clone(),
                });
            }
        }

        tracing::info!(
            inserted = report.inserted,
            skipped_existing = report.skipped_existing,
            skipped_duplicate = report.skipped_duplicate,
            no_faces = report.no_faces,
            failed = report.failed,
            "library load complete"
        );
        if let Some(ref tx) = progress_tx {
            let _ = tx.send(LoadProgress::Completed {
                report: report.clone(),
            });
        }

        Ok(report)
    }

    /// Wipe the store and rebuild it from the library, carrying every
    /// record that did not come from the library across the rebuild.
    ///
    /// User records keep their name, embedding, age, hash and timestamp
    /// but get fresh ids. They are restored even when the reload itself
    /// fails; in that case the reload error is returned afterwards.
    pub fn reset_and_reload(
        &self,
        store: &FaceStore,
        library: &str,
        progress_tx: Option<mpsc::Sender<LoadProgress>>,
    ) -> Result<LoadReport> {
        let prefix = format!("{library}/");
        let user_records: Vec<_> = store
            .list_all()?
            .into_iter()
            .filter(|r| !r.image_path.starts_with(&prefix))
            .collect();

        tracing::info!(
            library,
            user_records = user_records.len(),
            "resetting store before reload"
        );
        store.clear()?;

        let load_result = self.load_library(store, library, progress_tx);

        for record in &user_records {
            let restored = NewFaceRecord::new(
                record.name.clone(),
                record.image_path.clone(),
                record.embedding.clone(),
            )
            .with_age(record.age.clone())
            .with_hash(record.image_hash.clone())
            .with_timestamp(record.timestamp);
            store.insert(&restored)?;
        }
        if !user_records.is_empty() {
            tracing::info!(count = user_records.len(), "restored user records");
        }

        load_result
    }

    fn process_one(
        &self,
        store: &FaceStore,
        identifier: &str,
    ) -> Result<ItemOutcome, StoreError> {
        // cheap idempotence guard, before any decode work
        if store.exists_by_path(identifier)? {
            return Ok(ItemOutcome::SkippedExisting);
        }

        let bytes = match self.source.open(identifier) {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(ItemOutcome::Failed {
                    message: e.to_string(),
                })
            }
        };

        let hash = match hashing::perceptual_hash(&bytes) {
            Ok(hash) => hash,
            Err(e) => {
                return Ok(ItemOutcome::Failed {
                    message: e.to_string(),
                })
            }
        };

        let faces = match self.extractor.extract(&bytes) {
            Ok(faces) => faces,
            Err(e) => {
                return Ok(ItemOutcome::Failed {
                    message: e.to_string(),
                })
            }
        };

        if faces.is_empty() {
            return Ok(ItemOutcome::NoFaces);
        }

        let name = name_from_identifier(identifier);

        let mut inserted = 0;
        for face in &faces {
            let record = NewFaceRecord::new(name.clone(), identifier, face.embedding.clone())
                .with_hash(hash.clone());
            match store.insert_unless_duplicate(&record, self.duplicate_threshold)? {
                IngestOutcome::Inserted(_) => inserted += 1,
                outcome => {
                    tracing::debug!(path = %identifier, ?outcome, "face skipped as duplicate");
                }
            }
        }

        if inserted > 0 {
            Ok(ItemOutcome::Inserted { faces: inserted })
        } else {
            Ok(ItemOutcome::SkippedDuplicate)
        }
    }
}

fn name_from_identifier(identifier: &str) -> String {
    std::path::Path::new(identifier)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::DetectedFace;
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Diagonal stripes whose phase depends on the key, with the key
    /// itself stashed in the top-left pixel for the stub extractor.
    /// The stripes repeat every 8 keys, so tests keep distinct keys
    /// within 0..8 to get distinct perceptual hashes.
    fn keyed_png(key: u8) -> Vec<u8> {
        encode_keyed(key, image::ImageFormat::Png)
    }

    fn encode_keyed(key: u8, format: image::ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::from_fn(32, 32, |x, y| {
            if (x, y) == (0, 0) {
                return image::Rgb([key, 255, 255]);
            }
            let stripe = ((x + y + key as u32) / 4) % 2 == 0;
            let v = if stripe { 230 } else { 20 };
            image::Rgb([v, v, v])
        });
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    struct MemorySource {
        files: Vec<(String, Vec<u8>)>,
    }

    impl ImageSource for MemorySource {
        fn list(&self, library: &str) -> Result<Vec<String>> {
            let prefix = format!("{library}/");
            let mut ids: Vec<String> = self
                .files
                .iter()
                .map(|(id, _)| id.clone())
                .filter(|id| id.starts_with(&prefix))
                .collect();
            ids.sort();
            Ok(ids)
        }

        fn open(&self, identifier: &str) -> Result<Vec<u8>> {
            self.files
                .iter()
                .find(|(id, _)| id == identifier)
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| anyhow::anyhow!("no such file: {identifier}"))
        }
    }

    struct FailingSource;

    impl ImageSource for FailingSource {
        fn list(&self, _library: &str) -> Result<Vec<String>> {
            anyhow::bail!("listing is broken")
        }

        fn open(&self, identifier: &str) -> Result<Vec<u8>> {
            anyhow::bail!("no such file: {identifier}")
        }
    }

    /// Looks up faces by the key stored in the image's top-left pixel.
    struct KeyedExtractor {
        faces: HashMap<u8, Vec<DetectedFace>>,
    }

    impl KeyedExtractor {
        fn new(entries: &[(u8, Vec<Vec<f32>>)]) -> Self {
            let faces = entries
                .iter()
                .map(|(key, embeddings)| {
                    let detected = embeddings
                        .iter()
                        .map(|e| DetectedFace {
                            embedding: e.clone(),
                            confidence: 1.0,
                        })
                        .collect();
                    (*key, detected)
                })
                .collect();
            Self { faces }
        }
    }

    impl EmbeddingExtractor for KeyedExtractor {
        fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
            let img = image::load_from_memory(image)?.to_rgb8();
            let key = img.get_pixel(0, 0)[0];
            Ok(self.faces.get(&key).cloned().unwrap_or_default())
        }
    }

    fn loader(source: MemorySource, extractor: KeyedExtractor) -> LibraryLoader {
        LibraryLoader::new(Arc::new(source), Arc::new(extractor), 0.98)
    }

    #[test]
    fn test_load_fresh_library() {
        let source = MemorySource {
            files: vec![
                ("archive/alice.jpg".into(), keyed_png(0)),
                ("archive/people/bob smith.png".into(), keyed_png(2)),
            ],
        };
        let extractor = KeyedExtractor::new(&[
            (0, vec![vec![1.0, 0.0]]),
            (2, vec![vec![0.0, 1.0]]),
        ]);
        let store = FaceStore::open_in_memory().unwrap();

        let report = loader(source, extractor)
            .load_library(&store, "archive", None)
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "alice");
        assert_eq!(all[0].image_path, "archive/alice.jpg");
        assert_eq!(all[1].name, "bob smith");
        assert_eq!(all[1].image_path, "archive/people/bob smith.png");
        for record in &all {
            assert_eq!(record.image_hash.len(), 32);
            assert!(record.timestamp > 0);
        }
    }

    #[test]
    fn test_load_is_idempotent() {
        let files = vec![
            ("archive/a.jpg".into(), keyed_png(0)),
            ("archive/b.jpg".into(), keyed_png(2)),
        ];
        let embeddings: &[(u8, Vec<Vec<f32>>)] = &[
            (0, vec![vec![1.0, 0.0]]),
            (2, vec![vec![0.0, 1.0]]),
        ];
        let store = FaceStore::open_in_memory().unwrap();

        let first = loader(
            MemorySource {
                files: files.clone(),
            },
            KeyedExtractor::new(embeddings),
        )
        .load_library(&store, "archive", None)
        .unwrap();
        assert_eq!(first.inserted, 2);

        let second = loader(MemorySource { files }, KeyedExtractor::new(embeddings))
            .load_library(&store, "archive", None)
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(second.processed, 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_load_skips_similar_embeddings() {
        // different pictures of the same face: distinct hashes, matching
        // embeddings
        let source = MemorySource {
            files: vec![
                ("archive/a.jpg".into(), keyed_png(0)),
                ("archive/b.jpg".into(), keyed_png(2)),
            ],
        };
        let extractor = KeyedExtractor::new(&[
            (0, vec![vec![1.0, 0.0]]),
            (2, vec![vec![1.0, 0.0]]),
        ]);
        let store = FaceStore::open_in_memory().unwrap();

        let report = loader(source, extractor)
            .load_library(&store, "archive", None)
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_duplicate, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_load_skips_reencoded_copies() {
        // same pixels saved twice under different names and formats
        let source = MemorySource {
            files: vec![
                ("archive/original.png".into(), encode_keyed(0, image::ImageFormat::Png)),
                ("archive/copy.bmp".into(), encode_keyed(0, image::ImageFormat::Bmp)),
            ],
        };
        let extractor = KeyedExtractor::new(&[(0, vec![vec![1.0, 0.0]])]);
        let store = FaceStore::open_in_memory().unwrap();

        let report = loader(source, extractor)
            .load_library(&store, "archive", None)
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_duplicate, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_load_counts_faceless_images() {
        let source = MemorySource {
            files: vec![("archive/landscape.jpg".into(), keyed_png(0))],
        };
        let extractor = KeyedExtractor::new(&[(0, vec![])]);
        let store = FaceStore::open_in_memory().unwrap();

        let report = loader(source, extractor)
            .load_library(&store, "archive", None)
            .unwrap();

        assert_eq!(report.no_faces, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.processed, 1);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_load_continues_past_bad_items() {
        let source = MemorySource {
            files: vec![
                ("archive/broken.jpg".into(), b"not an image at all".to_vec()),
                ("archive/fine.jpg".into(), keyed_png(2)),
            ],
        };
        let extractor = KeyedExtractor::new(&[(2, vec![vec![1.0, 0.0]])]);
        let store = FaceStore::open_in_memory().unwrap();

        let (tx, rx) = mpsc::channel();
        let report = loader(source, extractor)
            .load_library(&store, "archive", Some(tx))
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.processed, 2);
        assert_eq!(store.count().unwrap(), 1);

        let events: Vec<LoadProgress> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, LoadProgress::Error { message } if message.contains("broken.jpg"))));
        // progress still covers the failed item
        let currents: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                LoadProgress::Processed { current, .. } => Some(*current),
                _ => None,
            })
            .collect();
        assert_eq!(currents, vec![1, 2]);
    }

    #[test]
    fn test_progress_events_in_order() {
        let source = MemorySource {
            files: vec![
                ("archive/a.jpg".into(), keyed_png(0)),
                ("archive/b.jpg".into(), keyed_png(2)),
                ("archive/c.jpg".into(), keyed_png(4)),
            ],
        };
        let extractor = KeyedExtractor::new(&[
            (0, vec![vec![1.0, 0.0, 0.0]]),
            (2, vec![vec![0.0, 1.0, 0.0]]),
            (4, vec![vec![0.0, 0.0, 1.0]]),
        ]);
        let store = FaceStore::open_in_memory().unwrap();

        let (tx, rx) = mpsc::channel();
        loader(source, extractor)
            .load_library(&store, "archive", Some(tx))
            .unwrap();

        let events: Vec<LoadProgress> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(LoadProgress::Started { total: 3 })));
        assert!(
            matches!(events.last(), Some(LoadProgress::Completed { report }) if report.inserted == 3)
        );

        let processed: Vec<(usize, String)> = events
            .iter()
            .filter_map(|e| match e {
                LoadProgress::Processed { current, path, .. } => Some((*current, path.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            processed,
            vec![
                (1, "archive/a.jpg".to_string()),
                (2, "archive/b.jpg".to_string()),
                (3, "archive/c.jpg".to_string()),
            ]
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let source = MemorySource {
            files: vec![("archive/a.jpg".into(), keyed_png(0))],
        };
        let extractor = KeyedExtractor::new(&[(0, vec![vec![1.0, 0.0]])]);
        let store = FaceStore::open_in_memory().unwrap();

        let cancel = AtomicBool::new(true);
        let (tx, rx) = mpsc::channel();
        let report = loader(source, extractor)
            .load_library_cancellable(&store, "archive", Some(tx), &cancel)
            .unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(store.count().unwrap(), 0);

        let events: Vec<LoadProgress> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, LoadProgress::Cancelled { processed: 0, total: 1 })));
    }

    #[test]
    fn test_cancel_between_items_keeps_partial_progress() {
        struct CancellingExtractor {
            cancel: Arc<AtomicBool>,
        }

        impl EmbeddingExtractor for CancellingExtractor {
            fn extract(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
                self.cancel.store(true, Ordering::Relaxed);
                Ok(vec![DetectedFace {
                    embedding: vec![1.0, 0.0],
                    confidence: 1.0,
                }])
            }
        }

        let source = MemorySource {
            files: vec![
                ("archive/a.jpg".into(), keyed_png(0)),
                ("archive/b.jpg".into(), keyed_png(2)),
            ],
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let loader = LibraryLoader::new(
            Arc::new(source),
            Arc::new(CancellingExtractor {
                cancel: Arc::clone(&cancel),
            }),
            0.98,
        );
        let store = FaceStore::open_in_memory().unwrap();

        let report = loader
            .load_library_cancellable(&store, "archive", None, &cancel)
            .unwrap();

        // first item landed before the flag was seen at the next boundary
        assert_eq!(report.processed, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_reset_and_reload_preserves_user_records() {
        let files = vec![
            ("archive/a.jpg".into(), keyed_png(0)),
            ("archive/b.jpg".into(), keyed_png(2)),
        ];
        let embeddings: &[(u8, Vec<Vec<f32>>)] = &[
            (0, vec![vec![1.0, 0.0]]),
            (2, vec![vec![0.0, 1.0]]),
        ];
        let store = FaceStore::open_in_memory().unwrap();

        let loader = loader(
            MemorySource {
                files: files.clone(),
            },
            KeyedExtractor::new(embeddings),
        );
        loader.load_library(&store, "archive", None).unwrap();

        let user_id = store
            .insert(
                &NewFaceRecord::new("bob", "uploads/bob.jpg", vec![0.5, 0.5])
                    .with_age("44")
                    .with_hash("cafe")
                    .with_timestamp(12345),
            )
            .unwrap();
        let old_archive_ids: Vec<i64> = store
            .list_all()
            .unwrap()
            .iter()
            .filter(|r| r.image_path.starts_with("archive/"))
            .map(|r| r.id)
            .collect();

        let loader = LibraryLoader::new(
            Arc::new(MemorySource { files }),
            Arc::new(KeyedExtractor::new(embeddings)),
            0.98,
        );
        let report = loader.reset_and_reload(&store, "archive", None).unwrap();
        assert_eq!(report.inserted, 2);

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 3);

        let user = all
            .iter()
            .find(|r| r.image_path == "uploads/bob.jpg")
            .expect("user record survived");
        assert_ne!(user.id, user_id);
        assert_eq!(user.name, "bob");
        assert_eq!(user.embedding, vec![0.5, 0.5]);
        assert_eq!(user.age, "44");
        assert_eq!(user.image_hash, "cafe");
        assert_eq!(user.timestamp, 12345);

        for record in all.iter().filter(|r| r.image_path.starts_with("archive/")) {
            assert!(!old_archive_ids.contains(&record.id));
        }
    }

    #[test]
    fn test_reset_restores_user_records_even_when_reload_fails() {
        let store = FaceStore::open_in_memory().unwrap();
        store
            .insert(&NewFaceRecord::new("bob", "uploads/bob.jpg", vec![0.5, 0.5]))
            .unwrap();
        store
            .insert(&NewFaceRecord::new("old", "archive/old.jpg", vec![1.0, 0.0]))
            .unwrap();

        let loader = LibraryLoader::new(
            Arc::new(FailingSource),
            Arc::new(KeyedExtractor::new(&[])),
            0.98,
        );
        assert!(loader.reset_and_reload(&store, "archive", None).is_err());

        // archive records are gone, but the user record came back
        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].image_path, "uploads/bob.jpg");
        assert_eq!(all[0].name, "bob");
    }

    #[test]
    fn test_name_from_identifier() {
        assert_eq!(name_from_identifier("archive/alice.jpg"), "alice");
        assert_eq!(name_from_identifier("archive/sub/Bob Smith.png"), "Bob Smith");
        assert_eq!(name_from_identifier("noext"), "noext");
    }
}
