use crate::backend::encode_path_component;
use crate::config::S3Config;
use crate::error::{StoreError, StoreResult};
use crate::models::VideoRecord;
use crate::uploader::Uploader;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::create_multipart_upload::builders::CreateMultipartUploadFluentBuilder;
use aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument, warn};

/// Uploads finished videos to an S3-compatible bucket
pub struct S3Uploader {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Uploader {
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 uploader initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    async fn simple_upload(&self, payload: &[u8], record: &VideoRecord, key: &str) -> StoreResult<()> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(payload.to_vec()))
            .content_type(content_type(record));

        with_put_metadata(request, record)
            .send()
            .await
            .map_err(|e| upload_error("put object", e))?;

        Ok(())
    }

    async fn multipart_upload(
        &self,
        payload: &[u8],
        record: &VideoRecord,
        key: &str,
    ) -> StoreResult<()> {
        let request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type(record));

        let created = with_multipart_metadata(request, record)
            .send()
            .await
            .map_err(|e| upload_error("create multipart upload", e))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::UploadFailed("no upload id in response".to_string()))?
            .to_string();

        match self.upload_parts(payload, key, &upload_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave no orphaned parts behind; the next attempt starts over
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, payload: &[u8], key: &str, upload_id: &str) -> StoreResult<()> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in payload.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| upload_error("upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| upload_error("complete multipart upload", e))?;

        Ok(())
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    #[instrument(skip(self, payload, record), fields(video_id = %record.id, size_bytes = payload.len()))]
    async fn upload(&self, payload: &[u8], record: &VideoRecord) -> StoreResult<()> {
        let key = object_key(record);
        debug!(key = %key, "Uploading video to S3");

        if payload.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(payload, record, &key).await?;
        } else {
            self.simple_upload(payload, record, &key).await?;
        }

        info!(key = %key, "Video uploaded to S3");
        Ok(())
    }
}

/// Object key: `videos/{YYYY-MM-DD}/{video_id}.{ext}`, dated by capture time
pub fn object_key(record: &VideoRecord) -> String {
    format!(
        "videos/{date}/{id}.{ext}",
        date = record.created_at.format("%Y-%m-%d"),
        id = encode_path_component(&record.id),
        ext = record.extension()
    )
}

fn content_type(record: &VideoRecord) -> String {
    let essence = record.mime_type.split(';').next().unwrap_or_default().trim();
    if essence.is_empty() {
        "application/octet-stream".to_string()
    } else {
        essence.to_lowercase()
    }
}

/// User metadata attached to the uploaded object
fn object_metadata(record: &VideoRecord) -> Vec<(&'static str, String)> {
    vec![
        ("video-id", ascii_only(&record.id)),
        ("filename", ascii_only(&record.filename)),
        ("duration-seconds", record.duration_seconds.to_string()),
        ("size-bytes", record.size_bytes.to_string()),
        ("created-at", record.created_at.to_rfc3339()),
    ]
}

fn with_put_metadata(mut request: PutObjectFluentBuilder, record: &VideoRecord) -> PutObjectFluentBuilder {
    for (key, value) in object_metadata(record) {
        request = request.metadata(key, value);
    }
    request
}

fn with_multipart_metadata(
    mut request: CreateMultipartUploadFluentBuilder,
    record: &VideoRecord,
) -> CreateMultipartUploadFluentBuilder {
    for (key, value) in object_metadata(record) {
        request = request.metadata(key, value);
    }
    request
}

/// Object metadata travels as HTTP headers
fn ascii_only(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

fn upload_error<E: std::error::Error>(operation: &str, error: E) -> StoreError {
    StoreError::UploadFailed(format!("{operation}: {}", DisplayErrorContext(&error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewVideo, VideoRecord};
    use chrono::{TimeZone, Utc};

    fn record(mime_type: &str) -> VideoRecord {
        VideoRecord::pending(
            "550e8400-e29b-41d4-a716-446655440000".to_string(),
            NewVideo {
                filename: "clip.webm".to_string(),
                mime_type: mime_type.to_string(),
                duration_seconds: 12.5,
            },
            4096,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap(),
        )
    }

    #[test]
    fn test_object_key() {
        assert_eq!(
            object_key(&record("video/webm")),
            "videos/2024-01-15/550e8400-e29b-41d4-a716-446655440000.webm"
        );
        assert_eq!(
            object_key(&record("video/mp4")),
            "videos/2024-01-15/550e8400-e29b-41d4-a716-446655440000.mp4"
        );
    }

    #[test]
    fn test_object_key_sanitizes_id() {
        let mut record = record("video/webm");
        record.id = "../../etc/passwd".to_string();
        assert_eq!(object_key(&record), "videos/2024-01-15/_2E_2E_2F_2E_2E_2Fetc_2Fpasswd.webm");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(&record("video/webm;codecs=vp9")), "video/webm");
        assert_eq!(content_type(&record("VIDEO/MP4")), "video/mp4");
        assert_eq!(content_type(&record("")), "application/octet-stream");
    }

    #[test]
    fn test_object_metadata() {
        let mut record = record("video/webm");
        record.filename = "café clip.webm".to_string();

        let metadata = object_metadata(&record);
        assert!(metadata.contains(&("filename", "caf_ clip.webm".to_string())));
        assert!(metadata.contains(&("duration-seconds", "12.5".to_string())));
        assert!(metadata.contains(&("size-bytes", "4096".to_string())));
    }
}
