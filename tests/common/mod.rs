#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use seqgate::bam::BGZF_EOF;
use seqgate::config::{ConfigLoader, ResolvedConfig};
use seqgate::domain::{FileRef, SubmissionContext};
use seqgate::engine::{Engine, HandleOutcome};
use seqgate::error::GateError;
use seqgate::key_parser::{KeyParser, ParsedKey};
use seqgate::notification::Notification;
use seqgate::registry::SpecRegistry;
use seqgate::retry::RetryPolicy;
use seqgate::storage::{ObjectStore, ObjectSummary};
use seqgate::tracker::TrackerSettings;
use seqgate::verdict::{Catalogue, Publisher, Verdict, VerdictEmitter};

pub const ILLUMINA_BUCKET: &str = "proj1-site1-illumina-prod";
pub const ONT_BUCKET: &str = "proj1-site1-ont-prod";
pub const UPLOAD_ONLY_BUCKET: &str = "proj1-site1-ont-prod-upload";

pub const FORWARD_KEY: &str = "proj1.0001.run1.1.fastq.gz";
pub const REVERSE_KEY: &str = "proj1.0001.run1.2.fastq.gz";
pub const METADATA_KEY: &str = "proj1.0001.run1.csv";
pub const CONSENSUS_KEY: &str = "proj1.0001.run1.fasta";
pub const ALIGNMENT_KEY: &str = "proj1.0001.run1.bam";

pub fn config_json() -> Value {
    let reads_layout = "project.run_index.run_id.direction.ftype.gzip";
    let plain_layout = "project.run_index.run_id.ftype";
    json!({
        "schema_version": 1,
        "runtime": {
            "workers": 2,
            "staleness_secs": 3600,
            "sweep_interval_secs": 30,
            "resolved_retention_secs": 86400
        },
        "pathogens": {
            "proj1": {
                "sites": ["site1", "site2"],
                "platforms": {
                    "illumina": [
                        {"role": "forward_reads", "suffix": ".1.fastq.gz", "layout": reads_layout, "format": "fastq"},
                        {"role": "reverse_reads", "suffix": ".2.fastq.gz", "layout": reads_layout, "format": "fastq"},
                        {"role": "metadata", "suffix": ".csv", "layout": plain_layout, "format": "csv"}
                    ],
                    "ont": [
                        {"role": "consensus", "suffix": ".fasta", "layout": plain_layout, "format": "fasta"},
                        {"role": "alignment", "suffix": ".bam", "layout": plain_layout, "format": "bam"},
                        {"role": "metadata", "suffix": ".csv", "layout": plain_layout, "format": "csv"}
                    ]
                },
                "naming": {
                    "allowed_characters": "alphanumeric,_,-",
                    "max_segment_length": 32,
                    "identical_basenames": true
                },
                "fasta": {
                    "min_length": 20,
                    "iupac_only": true,
                    "header_allowed_characters": "alphanumeric,_,-,.,/"
                },
                "fastq": {"iupac_only": true, "min_reads": 1},
                "bam": {
                    "allowed_references": ["MN908947.3"],
                    "compound_reference": true,
                    "human_references": ["chr1"],
                    "require_sorted": true,
                    "require_quickcheck": true,
                    "check_dehumanised": true,
                    "max_human_fraction": 0.01,
                    "require_primer_trimming": true,
                    "max_size_bytes": 10_000_000
                },
                "csv": {
                    "required_fields": ["run_index", "run_id", "sender_sample_id", "received_date"],
                    "optional_fields": ["sample_source", "ct_value"],
                    "allow_extra_fields": false,
                    "field_datatypes": {
                        "received_date": "date",
                        "ct_value": "integer",
                        "sample_source": "choice"
                    },
                    "field_choices": {"sample_source": ["swab", "saliva", "unknown"]},
                    "character_limits": {"sender_sample_id": "1-24"},
                    "sample_id_field": "sender_sample_id",
                    "disallow_sample_id_elsewhere": true,
                    "identity_fields": ["run_index", "run_id"]
                },
                "cross_file": {"paired_roles": [["forward_reads", "reverse_reads"]]},
                "bucket_policies": {
                    "site_ingest": ["get", "put", "list", "delete"],
                    "project_read": ["get", "list"],
                    "upload_only": ["put"]
                },
                "site_buckets": {
                    "ingest": {"name_layout": "{project}-{site}-{platform}-{test_flag}", "policy": "site_ingest"},
                    "upload": {"name_layout": "{project}-{site}-{platform}-{test_flag}-upload", "policy": "upload_only"}
                }
            }
        }
    })
}

pub fn resolve(config: &Value) -> Result<ResolvedConfig, GateError> {
    ConfigLoader::resolve_str(&config.to_string())
}

pub fn resolved() -> ResolvedConfig {
    resolve(&config_json()).unwrap()
}

pub fn registry() -> Arc<SpecRegistry> {
    Arc::new(resolved().registry)
}

pub fn tracker_settings() -> TrackerSettings {
    resolved().runtime.tracker
}

/// Seconds after a fixed reference instant.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap() + chrono::TimeDelta::seconds(secs)
}

pub fn etag(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

pub fn notification(bucket: &str, key: &str, content: &[u8], at: DateTime<Utc>) -> Notification {
    Notification {
        bucket: bucket.to_string(),
        key: key.to_string(),
        etag: etag(content),
        size: content.len() as u64,
        event_time: at,
        submitter: Some("site1-uploader".to_string()),
    }
}

/// Parses `key` in `bucket` and builds the tracker inputs for it.
pub fn admission_inputs(
    registry: &SpecRegistry,
    bucket: &str,
    key: &str,
    etag: &str,
    at: DateTime<Utc>,
) -> (SubmissionContext, ParsedKey, FileRef) {
    let context = registry.resolve_bucket(bucket).unwrap();
    let parsed = KeyParser::new(registry)
        .parse(key, &context.pathogen, Some(&context.platform))
        .unwrap();
    let file = FileRef {
        key: key.to_string(),
        etag: etag.to_string(),
        size: 100,
        received_at: at,
        submitter: None,
        basename: parsed.basename.clone(),
    };
    (context, parsed, file)
}

pub fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

pub fn fastq(reads: usize) -> Vec<u8> {
    let mut text = String::new();
    for index in 0..reads {
        text.push_str(&format!("@read{index}\nACGTACGTAC\n+\nIIIIIIIIII\n"));
    }
    gzip(text.as_bytes())
}

pub fn fasta(length: usize) -> Vec<u8> {
    let sequence = "ACGT".repeat(length / 4 + 1);
    format!(">proj1.0001.run1/consensus\n{}\n", &sequence[..length]).into_bytes()
}

pub const METADATA_HEADER: &str = "run_index,run_id,sender_sample_id,received_date,sample_source";

pub fn metadata_csv() -> Vec<u8> {
    format!("{METADATA_HEADER}\n0001,run1,S123,2024-01-05,swab\n").into_bytes()
}

pub fn bam_record(ref_id: i32, flag: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&ref_id.to_le_bytes());
    body.extend_from_slice(&100i32.to_le_bytes());
    body.extend_from_slice(&[1, 60]);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&flag.to_le_bytes());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.push(0);
    let mut record = (body.len() as i32).to_le_bytes().to_vec();
    record.extend(body);
    record
}

/// BGZF-framed BAM with the given header, references and records.
pub fn bam_with(text: &str, references: &[(&str, i32)], records: &[Vec<u8>]) -> Vec<u8> {
    let mut raw = b"BAM\x01".to_vec();
    raw.extend_from_slice(&(text.len() as i32).to_le_bytes());
    raw.extend_from_slice(text.as_bytes());
    raw.extend_from_slice(&(references.len() as i32).to_le_bytes());
    for (name, length) in references {
        raw.extend_from_slice(&((name.len() + 1) as i32).to_le_bytes());
        raw.extend_from_slice(name.as_bytes());
        raw.push(0);
        raw.extend_from_slice(&length.to_le_bytes());
    }
    for record in records {
        raw.extend_from_slice(record);
    }
    let mut bytes = gzip(&raw);
    bytes.extend_from_slice(&BGZF_EOF);
    bytes
}

pub const BAM_HEADER: &str =
    "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:MN908947.3\tLN:29903\n@PG\tID:ivar\tPN:ivar\tVN:1.4.2\n";

/// Sorted, primer-trimmed alignment with `human` of `total` reads on chr1.
pub fn bam(total: usize, human: usize) -> Vec<u8> {
    let records = (0..total)
        .map(|index| bam_record(if index < human { 1 } else { 0 }, 0))
        .collect::<Vec<_>>();
    bam_with(
        BAM_HEADER,
        &[("MN908947.3", 29903), ("chr1", 248_956_422)],
        &records,
    )
}

#[derive(Default)]
pub struct MockStore {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, DateTime<Utc>)>>,
    failures: Mutex<HashMap<String, u32>>,
    pub gets: AtomicUsize,
}

impl MockStore {
    pub fn put(&self, bucket: &str, key: &str, content: &[u8]) {
        self.put_at(bucket, key, content, at(0));
    }

    pub fn put_at(&self, bucket: &str, key: &str, content: &[u8], modified: DateTime<Utc>) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            (content.to_vec(), modified),
        );
    }

    /// The next `times` reads of `key` fail with a transient error.
    pub fn fail_next(&self, key: &str, times: u32) {
        self.failures.lock().unwrap().insert(key.to_string(), times);
    }

    fn object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, GateError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(content, _)| content.clone())
            .ok_or_else(|| GateError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

impl ObjectStore for MockStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, GateError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(GateError::TransientIo(format!("{bucket}/{key}: connection reset")));
        }
        self.object(bucket, key)
    }

    fn head_size(&self, bucket: &str, key: &str) -> Result<u64, GateError> {
        self.object(bucket, key).map(|content| content.len() as u64)
    }

    fn list(&self, bucket: &str) -> Result<Vec<ObjectSummary>, GateError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((stored_bucket, _), _)| stored_bucket == bucket)
            .map(|((_, key), (content, modified))| ObjectSummary {
                key: key.clone(),
                etag: etag(content),
                size: content.len() as u64,
                last_modified: *modified,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    verdicts: Mutex<Vec<Verdict>>,
    failures: Mutex<u32>,
}

impl RecordingPublisher {
    pub fn verdicts(&self) -> Vec<Verdict> {
        self.verdicts.lock().unwrap().clone()
    }

    /// The next `times` publishes fail as if the broker were down.
    pub fn fail_next(&self, times: u32) {
        *self.failures.lock().unwrap() = times;
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, verdict: &Verdict) -> Result<(), GateError> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(GateError::Publish("broker unavailable".to_string()));
        }
        self.verdicts.lock().unwrap().push(verdict.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCatalogue {
    registered: Mutex<Vec<String>>,
}

impl RecordingCatalogue {
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }
}

impl Catalogue for RecordingCatalogue {
    fn register(&self, verdict: &Verdict) -> Result<(), GateError> {
        self.registered
            .lock()
            .unwrap()
            .push(verdict.submission_id.clone());
        Ok(())
    }
}

pub type TestEngine = Engine<Arc<MockStore>, Arc<RecordingPublisher>, Arc<RecordingCatalogue>>;

pub struct Harness {
    pub engine: TestEngine,
    pub store: Arc<MockStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub catalogue: Arc<RecordingCatalogue>,
}

impl Harness {
    pub fn new(retry: RetryPolicy) -> Self {
        let store = Arc::new(MockStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let catalogue = Arc::new(RecordingCatalogue::default());
        let engine = Engine::new(
            registry(),
            tracker_settings(),
            store.clone(),
            VerdictEmitter::new(publisher.clone(), catalogue.clone()),
            retry,
        );
        Self {
            engine,
            store,
            publisher,
            catalogue,
        }
    }

    /// Uploads `content` and delivers its notification.
    pub fn submit(
        &self,
        bucket: &str,
        key: &str,
        content: &[u8],
        at: DateTime<Utc>,
    ) -> Result<HandleOutcome, GateError> {
        self.store.put(bucket, key, content);
        self.engine.handle(&notification(bucket, key, content, at))
    }
}

pub fn resolved_verdict(outcome: HandleOutcome) -> Verdict {
    match outcome {
        HandleOutcome::Resolved(verdict) => *verdict,
        other => panic!("expected a resolved verdict, got {other:?}"),
    }
}
