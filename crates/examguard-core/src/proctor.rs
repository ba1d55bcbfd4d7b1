//! The proctoring engine: enrollment, training, verification and
//! identification over shared, concurrently accessed state.
//!
//! Shared state and its discipline:
//! - classifier model: `RwLock<Option<Arc<LbphModel>>>`, built off-lock and
//!   swapped in after it is safely on disk;
//! - embedding cache: `RwLock<Arc<EmbeddingCache>>`, replaced wholesale in
//!   the same training pass;
//! - sample store: appends serialized per user.
//!
//! Verification and identification only clone `Arc`s and run in parallel.

use crate::annotate::annotate;
use crate::config::{ConfigError, ProctorConfig};
use crate::decision::{aggregate, tag_face, FaceTag, SessionStatus};
use crate::detector::{DetectorError, FaceDetector, SeetaDetector};
use crate::embedding::{EmbeddingCache, NearestUser};
use crate::labels::LabelRegistry;
use crate::lbph::{ClassifierError, LbphModel};
use crate::media::{self, FfmpegDecoder, MediaError, VideoDecoder};
use crate::recognizer::{ArcFaceEmbedder, FaceEmbedder, RecognizerError};
use crate::store::{normalize_face, validate_user_id, SampleStore, StoreError};
use crate::types::{BoundingBox, Embedding};
use image::{DynamicImage, GrayImage};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::{ControlFlow, Range};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProctorError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
enum EnrollError {
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
    #[error("media: {0}")]
    Media(#[from] MediaError),
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
    #[error("no face samples in the dataset")]
    NoSamples,
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("invalid image payload: {0}")]
    InvalidPayload(MediaError),
    #[error("failed to decode image: {0}")]
    UndecodableImage(MediaError),
    #[error("model not trained yet")]
    ModelNotReady,
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
}

/// Result of an enrollment submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnrollOutcome {
    /// Enough samples were on disk and training succeeded.
    pub accepted: bool,
    /// Samples on disk for the user after this submission.
    pub sample_count: usize,
}

impl EnrollOutcome {
    fn rejected() -> Self {
        Self { accepted: false, sample_count: 0 }
    }
}

/// One detected face in a verification frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceReport {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub label: FaceTag,
    /// Classifier distance rounded to 0.1; `null` in JSON when prediction failed.
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub boxes: Vec<FaceReport>,
    pub status: SessionStatus,
    /// Annotated frame as a `data:image/jpeg;base64,` URI (empty if encoding failed).
    pub preview: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifyMethod {
    Embedding,
    Lbph,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Distance of the best candidate on the scale of `method`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<IdentifyMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IdentifyReport {
    fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            user_id: None,
            distance: None,
            method: None,
            error: Some(error.to_string()),
        }
    }

    fn no_match(best: Option<(f64, IdentifyMethod)>) -> Self {
        Self {
            success: false,
            user_id: None,
            distance: best.map(|(d, _)| d),
            method: best.map(|(_, m)| m),
            error: None,
        }
    }

    fn matched(user_id: String, distance: f64, method: IdentifyMethod) -> Self {
        Self {
            success: true,
            user_id: Some(user_id),
            distance: Some(distance),
            method: Some(method),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub model_loaded: bool,
    pub model_trained_at: Option<String>,
    pub model_users: usize,
    pub model_samples: usize,
    pub enrolled_users: usize,
    pub cached_embeddings: usize,
    pub embedder_available: bool,
}

/// What a completed training pass produced.
#[derive(Debug, Clone, Copy)]
pub struct TrainSummary {
    pub users: usize,
    pub samples: usize,
    pub embeddings: usize,
}

pub struct Proctor {
    config: ProctorConfig,
    store: SampleStore,
    detector: Box<dyn FaceDetector>,
    video: Box<dyn VideoDecoder>,
    embedder: Option<Mutex<Box<dyn FaceEmbedder>>>,
    model: RwLock<Option<Arc<LbphModel>>>,
    embeddings: RwLock<Arc<EmbeddingCache>>,
    train_lock: Mutex<()>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stale_warned: AtomicBool,
}

impl Proctor {
    /// Build the production engine: SeetaFace detector (required), ffmpeg
    /// video decoding, and ArcFace embeddings when a model is configured.
    ///
    /// Fails if the config is invalid or the detector model cannot load.
    pub fn from_config(config: ProctorConfig) -> Result<Self, ProctorError> {
        config.validate()?;
        let detector = SeetaDetector::load(&config.detector_model_path)?;

        let embedder: Option<Box<dyn FaceEmbedder>> = match &config.embedding_model_path {
            None => {
                tracing::info!("no embedding model configured; identify uses LBPH only");
                None
            }
            Some(path) => match ArcFaceEmbedder::load(path) {
                Ok(e) => Some(Box::new(e)),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "embedding model unavailable; continuing without it"
                    );
                    None
                }
            },
        };

        Self::with_components(config, Box::new(detector), Box::new(FfmpegDecoder::new()), embedder)
    }

    /// Build an engine from explicit components.
    pub fn with_components(
        config: ProctorConfig,
        detector: Box<dyn FaceDetector>,
        video: Box<dyn VideoDecoder>,
        embedder: Option<Box<dyn FaceEmbedder>>,
    ) -> Result<Self, ProctorError> {
        config.validate()?;
        let store = SampleStore::open(&config.dataset_dir)?;
        let model = load_existing_model(&config);

        Ok(Self {
            config,
            store,
            detector,
            video,
            embedder: embedder.map(Mutex::new),
            model: RwLock::new(model.map(Arc::new)),
            embeddings: RwLock::new(Arc::new(EmbeddingCache::default())),
            train_lock: Mutex::new(()),
            user_locks: Mutex::new(HashMap::new()),
            stale_warned: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ProctorConfig {
        &self.config
    }

    /// Add face samples for `user_id` from a base64 photo or video, and
    /// retrain once the user has enough samples on disk.
    ///
    /// Never fails: bad input is reported as `accepted = false` with zero
    /// samples.
    pub fn enroll(&self, user_id: &str, media_base64: &str) -> EnrollOutcome {
        match self.try_enroll(user_id, media_base64) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(user = user_id, error = %e, "enrollment rejected");
                EnrollOutcome::rejected()
            }
        }
    }

    fn try_enroll(&self, user_id: &str, media_base64: &str) -> Result<EnrollOutcome, EnrollError> {
        validate_user_id(user_id)?;
        let bytes = media::decode_payload(media_base64)?;

        let user_lock = self.user_lock(user_id);
        let guard = lock(&*user_lock);

        let samples: Vec<GrayImage> = match media::decode_image(&bytes) {
            Ok(photo) => {
                tracing::info!(user = user_id, "enrollment: processing single photo");
                self.photo_sample(&photo.to_luma8()).into_iter().collect()
            }
            Err(_) => {
                tracing::info!(user = user_id, bytes = bytes.len(), "enrollment: processing video");
                self.video_samples(&bytes)?
            }
        };

        if samples.is_empty() {
            let sample_count = self.store.count(user_id)?;
            tracing::info!(user = user_id, sample_count, "enrollment: no face captured");
            return Ok(EnrollOutcome { accepted: false, sample_count });
        }

        let sample_count = self.store.append(user_id, &samples)?;
        drop(guard);

        let min = self.config.enrollment.min_samples;
        if sample_count < min {
            tracing::info!(
                user = user_id,
                added = samples.len(),
                sample_count,
                min,
                "enrollment: not enough samples to train yet"
            );
            return Ok(EnrollOutcome { accepted: false, sample_count });
        }

        tracing::info!(user = user_id, sample_count, "enrollment: starting training");
        let accepted = self.train();
        Ok(EnrollOutcome { accepted, sample_count })
    }

    /// First detected face of a still photo, normalized.
    fn photo_sample(&self, frame: &GrayImage) -> Option<GrayImage> {
        let faces = self.detector.detect(frame, &self.config.detector);
        faces
            .first()
            .map(|face| normalize_face(frame, face, self.config.face_size))
    }

    /// Every face in every sampled frame, up to the target count. Nothing is
    /// returned unless the whole recording decoded.
    fn video_samples(&self, bytes: &[u8]) -> Result<Vec<GrayImage>, MediaError> {
        let target = self.config.enrollment.target_samples;
        let mut samples = Vec::new();

        let frames = self.video.for_each_frame(
            bytes,
            self.config.enrollment.video_stride,
            &mut |frame: GrayImage| {
                for face in self.detector.detect(&frame, &self.config.video_detector) {
                    if samples.len() >= target {
                        break;
                    }
                    samples.push(normalize_face(&frame, &face, self.config.face_size));
                }
                if samples.len() >= target {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )?;

        tracing::info!(frames, collected = samples.len(), target, "enrollment: video processed");
        Ok(samples)
    }

    /// Retrain from the full Sample Store. Returns whether a new model was
    /// published; on failure the previous model stays in place.
    pub fn train(&self) -> bool {
        match self.try_train() {
            Ok(summary) => {
                tracing::info!(
                    users = summary.users,
                    samples = summary.samples,
                    embeddings = summary.embeddings,
                    "training complete"
                );
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "training failed");
                false
            }
        }
    }

    pub fn try_train(&self) -> Result<TrainSummary, TrainError> {
        let _guard = lock(&self.train_lock);

        let registry = LabelRegistry::from_store(&self.store)?;
        let mut samples = Vec::new();
        let mut labels = Vec::new();
        let mut ranges: Vec<(String, Range<usize>)> = Vec::new();

        for (label, user) in registry.users().iter().enumerate() {
            let user_samples = self.store.load(user, self.config.face_size)?;
            let start = samples.len();
            labels.extend(std::iter::repeat(label as i32).take(user_samples.len()));
            samples.extend(user_samples);
            ranges.push((user.clone(), start..samples.len()));
        }

        if samples.is_empty() {
            return Err(TrainError::NoSamples);
        }
        tracing::info!(users = registry.len(), samples = samples.len(), "training: fitting LBPH model");

        let model = LbphModel::train(self.config.lbph, &samples, &labels, registry.users().to_vec())?;
        let cache = self.embedding_cache(&samples, &ranges);

        model.save(&self.config.classifier_model_path)?;

        let summary = TrainSummary {
            users: registry.len(),
            samples: samples.len(),
            embeddings: cache.as_ref().map(|c| c.len()).unwrap_or(0),
        };

        *write(&self.model) = Some(Arc::new(model));
        if let Some(cache) = cache {
            *write(&self.embeddings) = Arc::new(cache);
        }
        self.stale_warned.store(false, Ordering::Relaxed);

        Ok(summary)
    }

    /// Mean embedding per user, or `None` without an embedder.
    fn embedding_cache(
        &self,
        samples: &[GrayImage],
        ranges: &[(String, Range<usize>)],
    ) -> Option<EmbeddingCache> {
        let embedder = self.embedder.as_ref()?;
        let mut embedder = lock(embedder);

        let mut per_user: BTreeMap<String, Vec<Embedding>> = BTreeMap::new();
        let mut failures = 0usize;
        for (user, range) in ranges {
            let embeddings = per_user.entry(user.clone()).or_default();
            for sample in &samples[range.clone()] {
                match embedder.embed(sample) {
                    Ok(e) => embeddings.push(e),
                    Err(err) => {
                        failures += 1;
                        tracing::debug!(user = %user, error = %err, "training: embedding failed");
                    }
                }
            }
        }
        if failures > 0 {
            tracing::warn!(failures, "training: some samples could not be embedded");
        }

        Some(EmbeddingCache::from_user_embeddings(per_user))
    }

    /// Check one frame against the expected user.
    pub fn verify(&self, user_id: &str, frame_base64: &str) -> Result<VerifyReport, VerifyError> {
        let bytes = media::decode_payload(frame_base64).map_err(VerifyError::InvalidPayload)?;
        let image = media::decode_image(&bytes).map_err(VerifyError::UndecodableImage)?;
        let model = self.current_model().ok_or(VerifyError::ModelNotReady)?;

        let registry = LabelRegistry::from_store(&self.store)?;
        self.check_staleness(&model, &registry);
        let expected_enrolled = registry.label_of(user_id).is_some();

        let gray = image.to_luma8();
        let faces = self.detector.detect(&gray, &self.config.detector);
        let threshold = self.config.thresholds.verify_distance;

        let mut tagged = Vec::with_capacity(faces.len());
        let mut boxes = Vec::with_capacity(faces.len());
        for face in &faces {
            let crop = normalize_face(&gray, face, self.config.face_size);
            let prediction = match model.predict(&crop) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::debug!(error = %e, "verify: prediction failed");
                    None
                }
            };
            let resolves = expected_enrolled
                && prediction
                    .as_ref()
                    .and_then(|p| model.user_of(p.label))
                    .is_some_and(|u| u == user_id);
            let (tag, distance) = tag_face(prediction.as_ref(), resolves, threshold);

            tagged.push((*face, tag));
            boxes.push(FaceReport {
                x: face.x,
                y: face.y,
                w: face.width,
                h: face.height,
                label: tag,
                confidence: (distance * 10.0).round() / 10.0,
            });
        }

        let tags: Vec<FaceTag> = tagged.iter().map(|(_, t)| *t).collect();
        let status = aggregate(&tags);
        tracing::debug!(user = user_id, faces = faces.len(), ?status, "verify: frame judged");

        Ok(VerifyReport {
            boxes,
            status,
            preview: self.render_preview(&image, &tagged),
        })
    }

    fn render_preview(&self, image: &DynamicImage, faces: &[(BoundingBox, FaceTag)]) -> String {
        let mut canvas = image.to_rgb8();
        annotate(&mut canvas, faces);
        media::encode_jpeg_data_uri(&canvas, self.config.preview_jpeg_quality).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "verify: preview encoding failed");
            String::new()
        })
    }

    /// Name the person in a frame without a prior claim.
    ///
    /// Prefers the embedding cache; falls back to the LBPH classifier. A
    /// frame matching nobody is `success = false` without an error.
    pub fn identify(&self, frame_base64: &str) -> IdentifyReport {
        let image = match media::decode_payload(frame_base64).and_then(|b| media::decode_image(&b)) {
            Ok(img) => img,
            Err(e) => {
                tracing::debug!(error = %e, "identify: undecodable frame");
                return IdentifyReport::failure(e);
            }
        };
        let registry = match LabelRegistry::from_store(&self.store) {
            Ok(r) => r,
            Err(e) => return IdentifyReport::failure(e),
        };

        let gray = image.to_luma8();
        let faces = self.detector.detect(&gray, &self.config.detector);
        let mut best: Option<(f64, IdentifyMethod)> = None;

        match self.identify_by_embedding(&gray, &faces) {
            Some(Ok(hit)) => {
                if hit.accepted && registry.label_of(&hit.user_id).is_some() {
                    return IdentifyReport::matched(hit.user_id, hit.distance as f64, IdentifyMethod::Embedding);
                }
                best = Some((hit.distance as f64, IdentifyMethod::Embedding));
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "identify: embedding failed; falling back to LBPH");
            }
            None => {}
        }

        let Some(model) = self.current_model() else {
            if best.is_some() {
                return IdentifyReport::no_match(best);
            }
            return IdentifyReport::failure(VerifyError::ModelNotReady);
        };
        self.check_staleness(&model, &registry);

        let mut nearest: Option<(i32, f64)> = None;
        for face in &faces {
            let crop = normalize_face(&gray, face, self.config.face_size);
            match model.predict(&crop) {
                Ok(p) if nearest.map_or(true, |(_, d)| p.distance < d) => {
                    nearest = Some((p.label, p.distance));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "identify: prediction failed"),
            }
        }

        if let Some((label, distance)) = nearest {
            let user = model
                .user_of(label)
                .filter(|u| registry.label_of(u).is_some());
            if let Some(user) = user {
                if distance < self.config.thresholds.verify_distance {
                    return IdentifyReport::matched(user.to_string(), distance, IdentifyMethod::Lbph);
                }
            }
            if best.is_none() {
                best = Some((distance, IdentifyMethod::Lbph));
            }
        }

        IdentifyReport::no_match(best)
    }

    /// `None` when there is no embedder or nothing cached yet.
    fn identify_by_embedding(
        &self,
        gray: &GrayImage,
        faces: &[BoundingBox],
    ) -> Option<Result<NearestUser, RecognizerError>> {
        let embedder = self.embedder.as_ref()?;
        let cache = Arc::clone(&*read(&self.embeddings));
        if cache.is_empty() {
            return None;
        }

        let probe = match faces.first() {
            Some(face) => normalize_face(gray, face, self.config.face_size),
            None => gray.clone(),
        };
        let embedding = match lock(embedder).embed(&probe) {
            Ok(e) => e,
            Err(e) => return Some(Err(e)),
        };
        let threshold = self.config.thresholds.identify_embedding_distance;
        cache.nearest(&embedding, threshold).map(Ok)
    }

    pub fn status(&self) -> EngineStatus {
        let model = self.current_model();
        let enrolled_users = self.store.users().map(|u| u.len()).unwrap_or(0);
        EngineStatus {
            model_loaded: model.is_some(),
            model_trained_at: model.as_ref().map(|m| m.trained_at().to_string()),
            model_users: model.as_ref().map(|m| m.users().len()).unwrap_or(0),
            model_samples: model.as_ref().map(|m| m.sample_count()).unwrap_or(0),
            enrolled_users,
            cached_embeddings: read(&self.embeddings).len(),
            embedder_available: self.embedder.is_some(),
        }
    }

    fn current_model(&self) -> Option<Arc<LbphModel>> {
        read(&self.model).clone()
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.user_locks);
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }

    /// Warn once per published model when enrollment has moved past it.
    fn check_staleness(&self, model: &LbphModel, registry: &LabelRegistry) {
        if model.users() != registry.users() && !self.stale_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                model_users = model.users().len(),
                enrolled_users = registry.len(),
                "classifier model is stale: enrolled users changed since the last training"
            );
        }
    }
}

/// Load the persisted model; a missing or unreadable file means "no model
/// yet" and the next training pass writes a fresh one.
fn load_existing_model(config: &ProctorConfig) -> Option<LbphModel> {
    let path = &config.classifier_model_path;
    if !path.exists() {
        tracing::info!(path = %path.display(), "no trained model yet; it is created after the first enrollment");
        return None;
    }
    match LbphModel::load(path) {
        Ok(model) => {
            if model.params() != config.lbph {
                tracing::warn!(
                    path = %path.display(),
                    "model was trained with different LBPH parameters; using the model's own"
                );
            }
            tracing::info!(
                path = %path.display(),
                users = model.users().len(),
                samples = model.sample_count(),
                "classifier model loaded"
            );
            Some(model)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "existing model unusable; a new one is created after enrollment");
            None
        }
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
