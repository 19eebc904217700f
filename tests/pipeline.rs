//! End-to-end workflow tests: happy path, degraded chunking, crash
//! resume, retry exhaustion and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use murmur::domain::{Job, JobStatus, ProgressEvent, Update};
use murmur::intake::TranscriptFormat;
use murmur::workflow::Activity;

const DEADLINE: Duration = Duration::from_secs(10);

fn milestones(updates: &[Update]) -> Vec<(JobStatus, Option<u8>)> {
    updates
        .iter()
        .filter_map(|u| match u {
            Update::Event(ProgressEvent {
                status,
                progress_pct,
                message: None,
                ..
            }) => Some((*status, *progress_pct)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn happy_path_two_chunk_job() {
    let transcriber = ScriptedTranscriber::happy();
    let oracle = Arc::new(PartitionOracle {
        spans: vec![(0, 13, "Greeting the world"), (13, 28, "Announcing a test")],
    });
    let h = harness(transcriber, Some(oracle));

    let job_id = h.store.create_job("alice", "talk.mp3", "/tmp/talk.mp3").unwrap();
    let mut sub = h.bus.subscribe(job_id);
    h.bus.publish(
        job_id,
        ProgressEvent {
            job_id,
            status: JobStatus::Pending,
            progress_pct: None,
            message: None,
            error: None,
        },
    );
    h.scheduler.start(job_id);

    let job = wait_for_terminal(&h.store, job_id, DEADLINE).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.transcript.as_deref(), Some(TRANSCRIPT));
    assert_eq!(job.language.as_deref(), Some("en"));

    // Two chunks with the exact char ranges and times from the partition.
    let chunks = h.store.get_chunks(job_id).unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(chunks[1].chunk_index, 1);
    assert_eq!(
        (chunks[0].start_char_pos, chunks[0].end_char_pos),
        (0, 13)
    );
    assert_eq!(
        (chunks[1].start_char_pos, chunks[1].end_char_pos),
        (13, 28)
    );
    assert_eq!((chunks[0].start_time, chunks[0].end_time), (0.0, 1.0));
    assert_eq!((chunks[1].start_time, chunks[1].end_time), (1.0, 2.5));
    assert_eq!(chunks[0].confidence, 0.9);

    for chunk in &chunks {
        let embedding = chunk.embedding.as_ref().expect("chunk must be embedded");
        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    // Milestone stream in publish order, message events aside.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let updates = drain_updates(&mut sub);
    assert_eq!(
        milestones(&updates),
        vec![
            (JobStatus::Pending, None),
            (JobStatus::Processing, Some(0)),
            (JobStatus::Processing, Some(60)),
            (JobStatus::Processing, Some(80)),
            (JobStatus::Completed, Some(100)),
        ]
    );

    // All three completion markers are present.
    let run_id = Job::workflow_run_id(job_id);
    for activity in Activity::ALL {
        assert!(h
            .store
            .is_activity_complete(&run_id, activity.name())
            .unwrap());
    }
}

#[tokio::test]
async fn submit_serves_transcript_downloads() {
    let h = harness(ScriptedTranscriber::happy(), Some(Arc::new(PartitionOracle {
        spans: vec![(0, 28, "One chunk")],
    })));

    let job_id = h
        .intake
        .submit("alice", "talk.mp3", b"fake audio bytes")
        .await
        .unwrap();
    let job = wait_for_terminal(&h.store, job_id, DEADLINE).await;
    assert_eq!(job.status, JobStatus::Completed);

    let txt = h.intake.get_transcript(job_id, TranscriptFormat::Txt).unwrap();
    assert_eq!(txt, TRANSCRIPT.as_bytes());

    let srt = String::from_utf8(h.intake.get_transcript(job_id, TranscriptFormat::Srt).unwrap())
        .unwrap();
    assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:01,000\nHello world.\n"));
    assert!(srt.contains("2\n00:00:01,000 --> 00:00:02,500\nThis is a test.\n"));
}

#[tokio::test]
async fn oracle_outage_degrades_to_sentence_chunks() {
    let h = harness(ScriptedTranscriber::happy(), Some(Arc::new(DownOracle)));

    let job_id = h
        .intake
        .submit("alice", "talk.mp3", b"fake audio")
        .await
        .unwrap();
    let job = wait_for_terminal(&h.store, job_id, DEADLINE).await;
    assert_eq!(job.status, JobStatus::Completed);

    // One chunk per sentence, with the degraded metadata shape.
    let chunks = h.store.get_chunks(job_id).unwrap();
    assert_eq!(chunks.len(), 2);
    for chunk in &chunks {
        assert_eq!(chunk.topic_summary, "");
        assert!(chunk.keywords.is_empty());
        assert_eq!(chunk.confidence, 0.0);
        assert!(chunk.embedding.is_some());
    }
}

#[tokio::test]
async fn resume_skips_activities_with_completion_markers() {
    // Transcriber that must never run: the transcribe marker already exists.
    let transcriber = ScriptedTranscriber::new(Script::DecodeError);
    let h = harness(
        Arc::clone(&transcriber) as Arc<dyn murmur::transcribe::Transcriber>,
        Some(Arc::new(PartitionOracle {
            spans: vec![(0, 13, "Greeting"), (13, 28, "Testing")],
        })),
    );

    // Simulate the pre-crash state: job mid-workflow, transcribe committed
    // together with its marker.
    let job_id = h.store.create_job("alice", "talk.mp3", "/tmp/talk.mp3").unwrap();
    h.store
        .update_status(job_id, JobStatus::Processing, None)
        .unwrap();
    let run_id = Job::workflow_run_id(job_id);
    let marker = murmur::store::CompletionMarker {
        workflow_run_id: run_id.clone(),
        activity_name: "transcribe".to_string(),
        payload: serde_json::json!({"segment_count": 2}),
    };
    h.store
        .save_transcription(
            job_id,
            TRANSCRIPT,
            &two_sentence_segments(),
            "en",
            Some(&marker),
        )
        .unwrap();

    // Restarted scheduler discovers the processing job and resumes at chunk.
    h.scheduler.recover().unwrap();

    let job = wait_for_terminal(&h.store, job_id, DEADLINE).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(transcriber.call_count(), 0, "transcribe must be skipped");

    let chunks = h.store.get_chunks(job_id).unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.embedding.is_some()));

    // Resume idempotence: extra recovery passes change nothing.
    let before: Vec<i64> = chunks.iter().map(|c| c.id).collect();
    let updated_at = job.updated_at;
    for _ in 0..3 {
        h.scheduler.recover().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job_after = h.store.get_job(job_id).unwrap();
    let after: Vec<i64> = h
        .store
        .get_chunks(job_id)
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(job_after.status, JobStatus::Completed);
    assert_eq!(job_after.updated_at, updated_at);
    assert_eq!(before, after);
}

#[tokio::test]
async fn decode_errors_exhaust_retries_and_fail() {
    let transcriber = ScriptedTranscriber::new(Script::DecodeError);
    let h = harness(
        Arc::clone(&transcriber) as Arc<dyn murmur::transcribe::Transcriber>,
        None,
    );

    let job_id = h.store.create_job("alice", "talk.mp3", "/tmp/talk.mp3").unwrap();
    let mut sub = h.bus.subscribe(job_id);
    h.scheduler.start(job_id);

    let job = wait_for_terminal(&h.store, job_id, Duration::from_secs(20)).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("decode-error"));
    assert_eq!(transcriber.call_count(), 3);
    assert!(h.store.get_chunks(job_id).unwrap().is_empty());
    assert!(job.transcript.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let failed_events = drain_updates(&mut sub)
        .into_iter()
        .filter(|u| matches!(u, Update::Event(e) if e.status == JobStatus::Failed))
        .count();
    assert_eq!(failed_events, 1);
}

#[tokio::test]
async fn missing_file_fails_without_retries_or_markers() {
    let transcriber = ScriptedTranscriber::new(Script::FileMissing);
    let h = harness(
        Arc::clone(&transcriber) as Arc<dyn murmur::transcribe::Transcriber>,
        None,
    );

    let job_id = h.store.create_job("alice", "gone.mp3", "/tmp/gone.mp3").unwrap();
    h.scheduler.start(job_id);

    let job = wait_for_terminal(&h.store, job_id, DEADLINE).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("file-missing"));
    assert_eq!(transcriber.call_count(), 1, "permanent errors skip retries");
    assert!(h.store.get_chunks(job_id).unwrap().is_empty());

    let run_id = Job::workflow_run_id(job_id);
    for activity in Activity::ALL {
        assert!(!h
            .store
            .is_activity_complete(&run_id, activity.name())
            .unwrap());
    }
}

#[tokio::test]
async fn cancel_during_transcribe_fails_within_a_heartbeat() {
    let transcriber = ScriptedTranscriber::new(Script::Slow {
        delay: Duration::from_secs(60),
    });
    let h = harness(
        Arc::clone(&transcriber) as Arc<dyn murmur::transcribe::Transcriber>,
        None,
    );

    let job_id = h.store.create_job("alice", "talk.mp3", "/tmp/talk.mp3").unwrap();
    let mut sub = h.bus.subscribe(job_id);
    h.scheduler.start(job_id);

    // Let the transcribe attempt get going, then cancel.
    wait_for_job(&h.store, job_id, DEADLINE, |j| {
        j.status == JobStatus::Processing
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.scheduler.cancel(job_id).unwrap();

    let job = wait_for_terminal(&h.store, job_id, Duration::from_secs(5)).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled"));
    assert!(job.transcript.is_none());
    assert!(h.store.get_chunks(job_id).unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let failed_events = drain_updates(&mut sub)
        .into_iter()
        .filter(|u| matches!(u, Update::Event(e) if e.status == JobStatus::Failed))
        .count();
    assert_eq!(failed_events, 1);
}

#[tokio::test]
async fn cancel_between_transcribe_and_chunk_keeps_the_transcript() {
    let h = harness(
        ScriptedTranscriber::happy(),
        Some(Arc::new(StalledOracle {
            delay: Duration::from_secs(60),
        })),
    );

    let job_id = h.store.create_job("alice", "talk.mp3", "/tmp/talk.mp3").unwrap();
    let mut sub = h.bus.subscribe(job_id);
    h.scheduler.start(job_id);

    // Wait until transcribe has committed, i.e. the chunk stage is running.
    wait_for_job(&h.store, job_id, DEADLINE, |j| j.transcript.is_some()).await;
    h.scheduler.cancel(job_id).unwrap();

    let job = wait_for_terminal(&h.store, job_id, Duration::from_secs(5)).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled"));
    assert_eq!(job.transcript.as_deref(), Some(TRANSCRIPT));
    assert!(job.segments.is_some());
    assert!(h.store.get_chunks(job_id).unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let failed_events = drain_updates(&mut sub)
        .into_iter()
        .filter(|u| matches!(u, Update::Event(e) if e.status == JobStatus::Failed))
        .count();
    assert_eq!(failed_events, 1);
}

#[tokio::test]
async fn zero_length_transcript_completes_with_no_chunks() {
    let transcriber = ScriptedTranscriber::new(Script::Success {
        transcript: String::new(),
        segments: Vec::new(),
        language: "en".to_string(),
    });
    let h = harness(
        Arc::clone(&transcriber) as Arc<dyn murmur::transcribe::Transcriber>,
        None,
    );

    let job_id = h
        .intake
        .submit("alice", "silence.mp3", b"fake audio")
        .await
        .unwrap();
    let job = wait_for_terminal(&h.store, job_id, DEADLINE).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.transcript.as_deref(), Some(""));
    assert!(h.store.get_chunks(job_id).unwrap().is_empty());

    let hits = h.search.search("alice", "anything at all", 5).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn saturated_queue_drains_in_fifo_order() {
    let h = harness(ScriptedTranscriber::happy(), None);

    let mut job_ids = Vec::new();
    for i in 0..6 {
        let job_id = h
            .intake
            .submit("alice", &format!("clip-{i}.mp3"), b"fake audio")
            .await
            .unwrap();
        job_ids.push(job_id);
    }

    // More jobs than queue slots: the sweeper drains the rest.
    for job_id in job_ids {
        let job = wait_for_terminal(&h.store, job_id, Duration::from_secs(20)).await;
        assert_eq!(job.status, JobStatus::Completed);
    }
}
