mod common;

use bytes::Bytes;
use common::{KIND, body, chunked, collect, harness, harness_with, new_file};
use files_service::{
    models::{
        file::{FileStatus, FindFilesQuery, ListFilesQuery, UpdateFileArgs},
        kind::FileKind,
    },
    services::{
        error::FileServiceError,
        storage::{MemoryBackend, StorageBackend},
    },
};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{io, sync::Arc, time::Duration};
use tokio::sync::oneshot;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ReportMeta {
    quarter: u8,
    team: String,
}

#[tokio::test]
async fn upload_makes_file_ready() {
    let h = harness().await;
    let created = h.service.create(new_file("q1.pdf")).await.unwrap();
    assert_eq!(created.status, FileStatus::AwaitingUpload);
    assert_eq!(created.size, None);
    assert_eq!(created.extension.as_deref(), Some("pdf"));

    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let ready = h
        .service
        .upload_content(&created.id, KIND, chunked(data.clone(), 1000))
        .await
        .unwrap();
    assert_eq!(ready.status, FileStatus::Ready);
    assert_eq!(ready.size, Some(4096));
    assert_eq!(ready.hash, Some(format!("{:x}", md5::compute(&data))));

    let (record, content) = h.service.download(&created.id, KIND).await.unwrap();
    assert_eq!(record.id, created.id);
    assert_eq!(collect(content).await, data);
}

#[tokio::test]
async fn second_upload_is_rejected() {
    let h = harness().await;
    let created = h.service.create(new_file("q1.pdf")).await.unwrap();
    h.service
        .upload_content(&created.id, KIND, body(b"first".to_vec()))
        .await
        .unwrap();

    let err = h
        .service
        .upload_content(&created.id, KIND, body(b"second".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, FileServiceError::InvalidState(_)), "{err:?}");

    let (_, content) = h.service.download(&created.id, KIND).await.unwrap();
    assert_eq!(collect(content).await, b"first");
}

#[tokio::test]
async fn upload_to_missing_file_is_not_found() {
    let h = harness().await;
    let err = h
        .service
        .upload_content("nope", KIND, body(b"data".to_vec()))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
}

#[tokio::test]
async fn download_before_upload_is_invalid_state() {
    let h = harness().await;
    let created = h.service.create(new_file("q1.pdf")).await.unwrap();
    let err = h.service.download(&created.id, KIND).await.err().unwrap();
    assert!(matches!(err, FileServiceError::InvalidState(_)), "{err:?}");
}

#[tokio::test]
async fn aborted_client_stream_reverts_to_awaiting_upload() {
    let h = harness().await;
    let created = h.service.create(new_file("q1.pdf")).await.unwrap();

    let broken = stream::iter(vec![
        Ok(Bytes::from_static(b"partial")),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
    ]);
    let err = h
        .service
        .upload_content(&created.id, KIND, broken)
        .await
        .unwrap_err();
    // a broken client stream is not a backend outage
    assert!(matches!(err, FileServiceError::Validation(_)), "{err:?}");
    assert!(!err.is_retryable());

    let record = h.service.get_by_id::<Value>(&created.id, KIND).await.unwrap();
    assert_eq!(record.status, FileStatus::AwaitingUpload);
    assert!(!h.memory.contains(&created.id, KIND));

    // a retry goes through
    h.service
        .upload_content(&created.id, KIND, body(b"complete".to_vec()))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelled_upload_releases_the_claim() {
    let h = harness().await;
    let created = h.service.create(new_file("q1.pdf")).await.unwrap();

    let stalled = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"head"))]).chain(stream::pending());
    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        h.service.upload_content(&created.id, KIND, stalled),
    )
    .await;
    assert!(attempt.is_err(), "upload should still be pending");

    // the release runs on a spawned task
    let mut status = FileStatus::Uploading;
    for _ in 0..50 {
        status = h
            .service
            .get_by_id::<Value>(&created.id, KIND)
            .await
            .unwrap()
            .status;
        if status == FileStatus::AwaitingUpload {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, FileStatus::AwaitingUpload);
    assert!(!h.memory.contains(&created.id, KIND));
}

#[tokio::test]
async fn concurrent_uploads_only_one_wins() {
    let h = harness().await;
    let created = h.service.create(new_file("q1.pdf")).await.unwrap();

    let (release, gate) = oneshot::channel::<()>();
    let slow = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"slow "))]).chain(stream::once(async move {
        let _ = gate.await;
        Ok(Bytes::from_static(b"writer"))
    }));

    let service = h.service.clone();
    let id = created.id.clone();
    let first = tokio::spawn(async move { service.upload_content(&id, KIND, slow).await });

    let mut claimed = false;
    for _ in 0..50 {
        let record = h.service.get_by_id::<Value>(&created.id, KIND).await.unwrap();
        if record.status == FileStatus::Uploading {
            claimed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(claimed);

    let err = h
        .service
        .upload_content(&created.id, KIND, body(b"fast writer".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, FileServiceError::InvalidState(_)), "{err:?}");

    release.send(()).unwrap();
    let ready = first.await.unwrap().unwrap();
    assert_eq!(ready.status, FileStatus::Ready);

    let (_, content) = h.service.download(&created.id, KIND).await.unwrap();
    assert_eq!(collect(content).await, b"slow writer");
}

#[tokio::test]
async fn kind_limits_are_enforced() {
    let mut images = FileKind::new("images", "img");
    images.max_size_bytes = Some(8);
    images.allowed_mime_types = Some(vec!["image/png".into()]);
    let h = harness_with(vec![Arc::new(MemoryBackend::new("img", None))], vec![images]).await;

    let mut args = new_file("logo.png");
    args.kind = "images".into();
    let err = h.service.create(args.clone()).await.unwrap_err();
    assert!(matches!(err, FileServiceError::Validation(_)), "{err:?}");

    args.mime_type = Some("image/png".into());
    let created = h.service.create(args).await.unwrap();

    let err = h
        .service
        .upload_content(&created.id, "images", chunked(vec![7u8; 20], 4))
        .await
        .unwrap_err();
    assert!(matches!(err, FileServiceError::Validation(_)), "{err:?}");

    let record = h.service.get_by_id::<Value>(&created.id, "images").await.unwrap();
    assert_eq!(record.status, FileStatus::AwaitingUpload);

    let ready = h
        .service
        .upload_content(&created.id, "images", body(vec![1u8; 8]))
        .await
        .unwrap();
    assert_eq!(ready.size, Some(8));
}

#[tokio::test]
async fn full_backend_is_unavailable_not_invalid() {
    let h = harness_with(
        vec![Arc::new(MemoryBackend::new("tiny", Some(4)))],
        vec![FileKind::new("scratch", "tiny")],
    )
    .await;
    let mut args = new_file("big.bin");
    args.kind = "scratch".into();
    let created = h.service.create(args).await.unwrap();

    let err = h
        .service
        .upload_content(&created.id, "scratch", body(vec![0u8; 16]))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

#[tokio::test]
async fn unknown_kind_is_a_configuration_error() {
    let h = harness().await;
    let mut args = new_file("q1.pdf");
    args.kind = "unregistered".into();
    let err = h.service.create(args).await.unwrap_err();
    assert!(matches!(err, FileServiceError::Configuration(_)), "{err:?}");

    let err = h
        .service
        .list::<Value>("unregistered", &ListFilesQuery::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FileServiceError::Configuration(_)), "{err:?}");
}

#[tokio::test]
async fn caller_supplied_ids_must_be_unique_and_safe() {
    let h = harness().await;
    let mut args = new_file("q1.pdf");
    args.id = Some("report-2024".into());
    let created = h.service.create(args.clone()).await.unwrap();
    assert_eq!(created.id, "report-2024");

    let err = h.service.create(args.clone()).await.unwrap_err();
    assert!(matches!(err, FileServiceError::InvalidState(_)), "{err:?}");

    args.id = Some("../escape".into());
    let err = h.service.create(args).await.unwrap_err();
    assert!(matches!(err, FileServiceError::Validation(_)), "{err:?}");
}

#[tokio::test]
async fn typed_metadata_round_trips_through_update() {
    let h = harness().await;
    let mut args = new_file("q1.pdf");
    let meta = ReportMeta {
        quarter: 1,
        team: "ops".into(),
    };
    let created = h
        .service
        .create(files_service::models::file::CreateFileArgs {
            id: args.id.take(),
            kind: args.kind,
            name: args.name,
            mime_type: args.mime_type,
            alt: args.alt,
            meta,
            created_by: args.created_by,
        })
        .await
        .unwrap();
    assert_eq!(created.meta.quarter, 1);

    let updated = h
        .service
        .update(UpdateFileArgs {
            id: created.id.clone(),
            kind: KIND.into(),
            name: Some("q2.pdf".into()),
            meta: Some(ReportMeta {
                quarter: 2,
                team: "finance".into(),
            }),
        })
        .await
        .unwrap();
    assert_eq!(updated.name, "q2.pdf");
    assert_eq!(updated.meta.team, "finance");
    assert_eq!(updated.status, FileStatus::AwaitingUpload);

    // shape mismatch surfaces as a validation error
    let err = h
        .service
        .get_by_id::<Vec<String>>(&created.id, KIND)
        .await
        .unwrap_err();
    assert!(matches!(err, FileServiceError::Validation(_)), "{err:?}");
}

#[tokio::test]
async fn delete_removes_record_and_content() {
    let h = harness().await;
    let created = h.service.create(new_file("q1.pdf")).await.unwrap();
    h.service
        .upload_content(&created.id, KIND, body(b"content".to_vec()))
        .await
        .unwrap();
    assert!(h.memory.contains(&created.id, KIND));

    h.service.delete(&created.id, KIND).await.unwrap();
    assert!(!h.memory.contains(&created.id, KIND));
    let err = h.service.get_by_id::<Value>(&created.id, KIND).await.unwrap_err();
    assert!(err.is_not_found());

    let err = h.service.delete(&created.id, KIND).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn find_and_list_filter_records() {
    let h = harness().await;
    for (name, team) in [("a.pdf", "ops"), ("b.PDF", "finance"), ("notes.txt", "ops")] {
        let mut args = new_file(name);
        args.meta = json!({ "team": team });
        h.service.create(args).await.unwrap();
    }

    let pdfs = h
        .service
        .find::<Value>(&FindFilesQuery {
            extension: vec!["pdf".into()],
            ..FindFilesQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(pdfs.len(), 2);

    let ops = h
        .service
        .find::<Value>(&FindFilesQuery {
            meta: Some(json!({ "team": "ops" })),
            ..FindFilesQuery::default()
        })
        .await
        .unwrap();
    let mut names: Vec<_> = ops.into_iter().map(|f| f.name).collect();
    names.sort();
    assert_eq!(names, vec!["a.pdf", "notes.txt"]);

    let by_name = h
        .service
        .find::<Value>(&FindFilesQuery {
            name: vec!["note".into()],
            ..FindFilesQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(by_name.len(), 1);

    let excluded = h
        .service
        .find::<Value>(&FindFilesQuery {
            kind_to_exclude: vec![KIND.into()],
            ..FindFilesQuery::default()
        })
        .await
        .unwrap();
    assert!(excluded.is_empty());

    let nothing = h
        .service
        .find::<Value>(&FindFilesQuery {
            kind: vec!["elsewhere".into()],
            ..FindFilesQuery::default()
        })
        .await
        .unwrap();
    assert!(nothing.is_empty());

    let ready = h
        .service
        .list::<Value>(
            KIND,
            &ListFilesQuery {
                status: Some(FileStatus::Ready),
                ..ListFilesQuery::default()
            },
        )
        .await
        .unwrap();
    assert!(ready.is_empty());

    let page = h
        .service
        .list::<Value>(
            KIND,
            &ListFilesQuery {
                status: None,
                page: Some(2),
                per_page: Some(2),
            },
        )
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn content_written_directly_is_invisible_without_a_record() {
    let h = harness().await;
    h.memory
        .write("ghost", KIND, body(b"orphan".to_vec()).boxed())
        .await
        .unwrap();
    let err = h.service.download("ghost", KIND).await.err().unwrap();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn metadata_filter_rejects_quoted_keys() {
    let h = harness().await;
    let mut args = new_file("a.pdf");
    args.meta = json!({ "team": "ops" });
    h.service.create(args).await.unwrap();

    let err = h
        .service
        .find::<Value>(&FindFilesQuery {
            meta: Some(json!({ "te\"am": "ops" })),
            ..FindFilesQuery::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FileServiceError::Validation(_)), "{err:?}");

    // other punctuation in keys is fine
    let none = h
        .service
        .find::<Value>(&FindFilesQuery {
            meta: Some(json!({ "team.name": "ops" })),
            ..FindFilesQuery::default()
        })
        .await
        .unwrap();
    assert!(none.is_empty());
}
