use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use futures::stream::{self, Stream};
use log::{info, warn};
use rusoto_s3::{
    GetObjectRequest, HeadObjectRequest, ListObjectsV2Request, PutObjectRequest, S3Client,
    StreamingBody, S3,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::configuration::{Configuration, Destination};
use crate::error::DeliveryError;
use crate::helper::{spawn_progress_printer, ProgressStats};

use super::{is_candidate, pick_newest, Delivery, DestinationAdapter};

/// Reads `file` in fixed size chunks for a streaming request body. Every read
/// runs on the blocking pool so the runtime threads never wait on the disk.
fn file_chunks(file: File) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static {
    stream::unfold(Some(file), |file| async move {
        let mut file = match file {
            Some(file) => file,
            None => return None,
        };
        let chunk = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0; Configuration::BUFFER_SIZE];
            let read = file.read(&mut buffer).map(|read_bytes| {
                buffer.truncate(read_bytes);
                buffer
            });
            (file, read)
        })
        .await;
        match chunk {
            Ok((_, Ok(buffer))) if buffer.is_empty() => None,
            Ok((file, Ok(buffer))) => Some((Ok(Bytes::from(buffer)), Some(file))),
            Ok((_, Err(err))) => Some((Err(err), None)),
            Err(err) => Some((Err(io::Error::new(io::ErrorKind::Other, err)), None)),
        }
    })
}

/// An S3 compatible bucket.
pub struct S3Destination {
    id: String,
    bucket: String,
    client: S3Client,
}

impl S3Destination {
    pub fn new(destination: &Destination) -> Self {
        Self {
            id: destination.id.clone(),
            bucket: destination.s3_bucket.clone(),
            client: S3Client::new(destination.s3_region.clone()),
        }
    }

    pub fn create(destination: &Destination) -> Arc<dyn DestinationAdapter> {
        Arc::new(Self::new(destination))
    }

    async fn list_candidates(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> Result<Vec<(String, NaiveDateTime)>, DeliveryError> {
        let mut candidates = Vec::new();
        let mut continuation_token = None;
        loop {
            let request = ListObjectsV2Request {
                bucket: self.bucket.clone(),
                prefix: Some(prefix.to_string()).filter(|prefix| !prefix.is_empty()),
                continuation_token: continuation_token.take(),
                ..Default::default()
            };
            let objects = self
                .client
                .list_objects_v2(request)
                .await
                .map_err(|err| DeliveryError::transfer(&self.id, err))?;

            for object in objects.contents.unwrap_or_default() {
                let (key, modified) = match (object.key, object.last_modified) {
                    (Some(key), Some(modified)) => (key, modified),
                    _ => continue,
                };
                if !is_candidate(&key, prefix, suffix) {
                    continue;
                }
                match NaiveDateTime::parse_from_str(&modified, "%Y-%m-%dT%H:%M:%S%.fZ") {
                    Ok(modified) => candidates.push((key, modified)),
                    Err(_) => warn!("ignoring '{}': unreadable timestamp '{}'", key, modified),
                }
            }

            match objects.next_continuation_token {
                Some(token) if objects.is_truncated == Some(true) => {
                    continuation_token = Some(token)
                }
                _ => break,
            }
        }

        Ok(candidates)
    }

    async fn download(&self, key: &str, target: &Path) -> Result<(), DeliveryError> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            ..Default::default()
        };
        let object = self
            .client
            .get_object(request)
            .await
            .map_err(|err| DeliveryError::transfer(&self.id, err))?;
        let body = object
            .body
            .ok_or_else(|| DeliveryError::transfer(&self.id, "no body in S3-object"))?;

        let mut stats = ProgressStats::new();
        stats.total_length = object.content_length.map(|length| length as usize);
        let stats = Arc::new(Mutex::new(stats));
        let printer = spawn_progress_printer(Arc::clone(&stats), String::from("downloading... "));

        let result = copy_body(body, target, &stats).await;
        if let Ok(mut stats) = stats.lock() {
            stats.set_finished();
        }
        printer.join().unwrap_or_default();

        result.map_err(|err| DeliveryError::transfer(&self.id, err))
    }
}

async fn copy_body(
    body: StreamingBody,
    target: &Path,
    stats: &Arc<Mutex<ProgressStats>>,
) -> io::Result<()> {
    let mut reader = body.into_async_read();
    let mut file = tokio::fs::File::create(target).await?;
    let mut buffer = vec![0; Configuration::BUFFER_SIZE];
    loop {
        let read_bytes = reader.read(&mut buffer).await?;
        if read_bytes == 0 {
            break;
        }
        file.write_all(&buffer[..read_bytes]).await?;
        if let Ok(mut stats) = stats.lock() {
            stats.add_progressed_size(read_bytes);
        }
    }
    file.flush().await?;
    file.sync_all().await
}

#[async_trait]
impl DestinationAdapter for S3Destination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, file: &Path, object_name: &str) -> Result<Delivery, DeliveryError> {
        let size = tokio::fs::metadata(file)
            .await
            .map_err(|err| DeliveryError::transfer(&self.id, err))?
            .len();
        let reader = tokio::fs::File::open(file)
            .await
            .map_err(|err| DeliveryError::transfer(&self.id, err))?
            .into_std()
            .await;

        info!("destination '{}': uploading '{}'", self.id, object_name);
        let request = PutObjectRequest {
            bucket: self.bucket.clone(),
            key: object_name.to_string(),
            content_length: Some(size as i64),
            body: Some(StreamingBody::new(file_chunks(reader))),
            server_side_encryption: Some(String::from("AES256")),
            ..Default::default()
        };
        let response = self
            .client
            .put_object(request)
            .await
            .map_err(|err| DeliveryError::transfer(&self.id, err))?;
        if response.e_tag.is_none() {
            return Err(DeliveryError::verification(&self.id, "response carries no ETag"));
        }

        let head = self
            .client
            .head_object(HeadObjectRequest {
                bucket: self.bucket.clone(),
                key: object_name.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|err| DeliveryError::verification(&self.id, err))?;
        if head.content_length != Some(size as i64) {
            return Err(DeliveryError::verification(
                &self.id,
                format!(
                    "stored size {:?} differs from local size {}",
                    head.content_length, size
                ),
            ));
        }

        info!("destination '{}': uploaded '{}'", self.id, object_name);
        Ok(Delivery {
            destination: self.id.clone(),
            location: format!("s3://{}/{}", self.bucket, object_name),
            size,
        })
    }

    async fn retrieve_latest(
        &self,
        prefix: &str,
        suffix: &str,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>, DeliveryError> {
        let key = match pick_newest(self.list_candidates(prefix, suffix).await?) {
            Some(key) => key,
            None => {
                warn!("destination '{}': no S3 object found", self.id);
                return Ok(None);
            }
        };

        info!("found latest key: {:?}", key);
        let file_name = key.rsplit('/').next().unwrap_or(key.as_str());
        let target = target_dir.join(file_name);
        self.download(&key, &target).await?;
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use futures::TryStreamExt;

    use super::*;

    fn assert_request_body<T: Stream + Send + Sync + 'static>(_: &T) {}

    #[tokio::test]
    async fn test_file_chunks_cover_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..Configuration::BUFFER_SIZE * 2 + 10)
            .map(|index| (index % 251) as u8)
            .collect();
        file.write_all(&content).unwrap();

        let chunks = file_chunks(File::open(file.path()).unwrap());
        assert_request_body(&chunks);
        let chunks: Vec<Bytes> = chunks.try_collect().await.unwrap();

        let sizes: Vec<usize> = chunks.iter().map(|chunk| chunk.len()).collect();
        assert_eq!(
            sizes,
            vec![Configuration::BUFFER_SIZE, Configuration::BUFFER_SIZE, 10]
        );
        assert_eq!(chunks.concat(), content);
    }

    #[tokio::test]
    async fn test_empty_file_yields_no_chunk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let chunks: Vec<Bytes> = file_chunks(File::open(file.path()).unwrap())
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }
}
