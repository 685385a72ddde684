//! End to end tests over real files in temporary directories.

mod common;

use bytes::Bytes;
use tempfile::TempDir;
use tokio_stream::StreamExt;

use tuskfile::heap_file::HeapFileConfig;
use tuskfile::page_formats::PageOffset;
use tuskfile::{HeapConfig, HeapFile, HeapFileError, PersistenceId};

/// 128 byte pages keep multi page records small: 123 payload bytes fit the
/// first page, 127 each continuation.
fn small_pages() -> HeapFileConfig {
    HeapFileConfig {
        page_size: 128,
        alignment_padding_size: 0,
        heap: HeapConfig {
            min_viable_split: 1,
            growth_factor: 0.0,
            defrag_free_ratio: 1.0,
        },
    }
}

#[tokio::test]
async fn test_roundtrip_at_page_boundaries() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logging();
    let tmp = TempDir::new()?;
    let path = tmp.path().join("boundaries");
    let file = HeapFile::create(&path, small_pages()).await?;

    // One byte under, exactly at, and one byte over the first page capacity,
    // plus a record spanning several continuations
    for length in [122usize, 123, 124, 640].iter() {
        let payload: Vec<u8> = (0..*length).map(|i| (i % 251) as u8).collect();
        let id = file.add_record(Bytes::from(payload.clone()), true).await?;
        let read_back = file.use_record(id, |bytes| bytes.to_vec()).await?;
        assert_eq!(read_back, payload, "length {}", length);
    }

    file.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_removed_record_is_gone() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logging();
    let tmp = TempDir::new()?;
    let path = tmp.path().join("removal");
    let file = HeapFile::create(&path, small_pages()).await?;

    let id = file.add_record(Bytes::from(vec![9u8; 300]), true).await?;
    file.remove_record(id).await?;

    assert!(matches!(
        file.use_record(id, |_| ()).await,
        Err(HeapFileError::InvalidReference(bad, _)) if bad == id
    ));
    assert!(matches!(
        file.remove_record(id).await,
        Err(HeapFileError::InvalidReference(_, _))
    ));

    file.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_freed_space_is_reused_without_growth() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("reuse");
    let file = HeapFile::create(&path, small_pages()).await?;

    let _a = file.add_record(Bytes::from_static(b"first"), false).await?;
    let b = file.add_record(Bytes::from_static(b"second"), false).await?;
    let _c = file.add_record(Bytes::from_static(b"third"), false).await?;
    assert_eq!(file.page_count().await, 3);

    file.remove_record(b).await?;
    assert_eq!(file.free_page_count().await, 1);

    let d = file.add_record(Bytes::from_static(b"fourth"), false).await?;
    assert_eq!(d, b, "the freed page is the lowest fit");
    assert_eq!(file.page_count().await, 3);
    assert_eq!(file.free_page_count().await, 0);

    file.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_reopen_recovers_free_space() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logging();
    let tmp = TempDir::new()?;
    let path = tmp.path().join("recovery");

    // a: 1 page, b: 2 pages, c: 1 page
    let (a, c) = {
        let file = HeapFile::create(&path, small_pages()).await?;
        let a = file.add_record(Bytes::from_static(b"aaaa"), true).await?;
        let b = file.add_record(Bytes::from(vec![2u8; 200]), true).await?;
        let c = file.add_record(Bytes::from_static(b"cccc"), true).await?;
        file.remove_record(b).await?;
        file.close().await?;
        (a, c)
    };

    let file = HeapFile::open(&path, small_pages()).await?;
    assert_eq!(file.page_count().await, 4);
    assert_eq!(file.free_page_count().await, 2);

    // A two page record must land in the recovered hole, not grow the file
    let d = file.add_record(Bytes::from(vec![4u8; 150]), true).await?;
    assert_eq!(d, PersistenceId(PageOffset(1)));
    assert_eq!(file.page_count().await, 4);

    // The survivors read back fine after the reopen
    file.use_record(a, |bytes| assert_eq!(bytes, b"aaaa")).await?;
    file.use_record(c, |bytes| assert_eq!(bytes, b"cccc")).await?;

    file.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_all_records_skips_removed() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("scan");
    let file = HeapFile::create(&path, small_pages()).await?;

    let a = file.add_record(Bytes::from_static(b"alpha"), false).await?;
    let b = file.add_record(Bytes::from(vec![5u8; 400]), false).await?;
    let c = file.add_record(Bytes::from_static(b"gamma"), false).await?;
    file.remove_record(b).await?;

    let stream = file.all_records();
    tokio::pin!(stream);
    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        let (id, payload) = item?;
        seen.push((id, payload.to_vec()));
    }

    assert_eq!(
        seen,
        vec![(a, b"alpha".to_vec()), (c, b"gamma".to_vec())]
    );

    file.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_rejects_new_operations() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("closing");
    let file = HeapFile::create(&path, small_pages()).await?;

    let id = file.add_record(Bytes::from_static(b"data"), false).await?;
    file.close().await?;
    file.close().await?; // closing twice is fine

    assert!(matches!(
        file.add_record(Bytes::from_static(b"late"), false).await,
        Err(HeapFileError::Closed)
    ));
    assert!(matches!(
        file.use_record(id, |_| ()).await,
        Err(HeapFileError::Closed)
    ));
    assert!(matches!(
        file.remove_record(id).await,
        Err(HeapFileError::Closed)
    ));

    let stream = file.all_records();
    tokio::pin!(stream);
    match stream.next().await {
        Some(Err(HeapFileError::Closed)) => {}
        other => panic!("Scan on a closed file should fail, got {:?}", other.is_some()),
    }
    Ok(())
}

#[tokio::test]
async fn test_open_rejects_wrong_version() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("version");
    {
        let file = HeapFile::create(&path, small_pages()).await?;
        file.close().await?;
    }

    // Mangle the version tag in place
    let mut raw = tokio::fs::read(&path).await?;
    raw[3] = 0x7F;
    tokio::fs::write(&path, raw).await?;

    assert!(HeapFile::open(&path, small_pages()).await.is_err());
    Ok(())
}
