//! Render-thread upload of pending frames
//!
//! Each dirty stream is uploaded in two phases: every plane is staged
//! (acquire, map, copy, unmap) and every destination is checked; only if all
//! of that succeeds are the device copies issued. A failing stream is skipped
//! for the tick; the loop over the other streams always continues.

use crate::dispatcher::{PendingUpload, StreamDispatcher, StreamId};
use crate::dirty::DirtySet;
use crate::error::UploadError;
use nvr_gpu::{RenderBackend, StagingLease, StagingPool};
use nvr_video::{copy_plane, FramePool, StagingDesc, MAX_PLANES};
use std::sync::Arc;

/// Graphics state owned by the render thread between Initialize and
/// Shutdown
pub(crate) struct Device {
    pub backend: Box<dyn RenderBackend>,
    pub staging: StagingPool,
}

/// Summary of one render tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// Streams taken from the dirty set
    pub drained: usize,
    pub uploaded: usize,
    /// Dirty streams with nothing to upload (disabled, destroyed or rebound)
    pub skipped: usize,
    pub failed: usize,
    /// Device copy regions issued
    pub copies: usize,
    /// Staging resources that became reusable at the end of the tick
    pub promoted: usize,
    pub evicted: usize,
}

pub(crate) fn run_tick(
    tick: u64,
    device: &mut Device,
    dirty: &DirtySet,
    frame_pool: &FramePool,
    resolve: impl Fn(StreamId) -> Option<Arc<StreamDispatcher>>,
) -> TickReport {
    let mut report = TickReport {
        tick,
        ..TickReport::default()
    };

    let streams = dirty.drain();
    report.drained = streams.len();

    for id in streams {
        let Some((stream, upload)) = resolve(id).and_then(|stream| {
            let upload = stream.take_pending()?;
            Some((stream, upload))
        }) else {
            report.skipped += 1;
            continue;
        };

        match upload_stream(device.backend.as_mut(), &mut device.staging, &upload) {
            Ok(copies) => {
                report.uploaded += 1;
                report.copies += copies;
                stream.record_upload(true);
            }
            Err(err) => {
                report.copies += err.copies_issued();
                match &err {
                    UploadError::Staging(_)
                    | UploadError::Backend(_)
                    | UploadError::Destination { .. }
                    | UploadError::CopyInterrupted { .. } => {
                        log::warn!("stream {}: upload skipped: {}", id, err)
                    }
                    _ => log::debug!("stream {}: upload skipped: {}", id, err),
                }
                report.failed += 1;
                stream.record_upload(false);
            }
        }

        frame_pool.release(upload.frame);
    }

    let reclaimed = device
        .staging
        .process_end_of_tick(tick, device.backend.as_mut());
    report.promoted = reclaimed.promoted;
    report.evicted = reclaimed.evicted;
    report
}

/// Upload one stream's frame. Returns the number of copy regions issued.
pub(crate) fn upload_stream(
    backend: &mut dyn RenderBackend,
    staging: &mut StagingPool,
    upload: &PendingUpload,
) -> Result<usize, UploadError> {
    let planes = upload
        .textures
        .len()
        .min(upload.frame.desc().plane_count())
        .min(MAX_PLANES);

    let mut leases = Vec::with_capacity(planes);
    let result = match stage_planes(backend, staging, upload, planes, &mut leases) {
        Ok(()) => copy_planes(backend, upload, &leases),
        Err(err) => Err(err),
    };

    for lease in leases {
        staging.release(lease);
    }
    result
}

fn stage_planes(
    backend: &mut dyn RenderBackend,
    staging: &mut StagingPool,
    upload: &PendingUpload,
    planes: usize,
    leases: &mut Vec<StagingLease>,
) -> Result<(), UploadError> {
    let frame = upload.frame.desc();
    let format = frame.kind().plane_format();

    for plane in 0..planes {
        let texture = &upload.textures[plane];
        let (width, height) = frame.plane_size(plane);
        if (texture.width, texture.height) != (width, height) {
            return Err(UploadError::SizeMismatch {
                plane,
                plane_size: (width, height),
                texture: (texture.width, texture.height),
            });
        }
        let src = frame.plane(plane).ok_or(UploadError::MissingPlane(plane))?;
        let src_stride = frame.stride(plane) as usize;

        let desc = StagingDesc::new(format, width, height);
        let lease = staging.acquire(backend, desc)?;
        let id = lease.id();
        leases.push(lease);

        let rows = height as usize;
        let mut copied = 0;
        backend.map_write(id, &mut |data: &mut [u8], row_pitch: usize| {
            copied = copy_plane(src, src_stride, data, row_pitch, desc.row_bytes(), rows);
        })?;
        if copied < rows {
            return Err(UploadError::ShortMapping {
                plane,
                rows: copied,
                needed: rows,
            });
        }
    }

    Ok(())
}

fn copy_planes(
    backend: &mut dyn RenderBackend,
    upload: &PendingUpload,
    leases: &[StagingLease],
) -> Result<usize, UploadError> {
    let frame = upload.frame.desc();
    let damage = frame.dirty_rects();

    // A bad destination on any plane leaves every plane on the previous frame
    for (plane, lease) in leases.iter().enumerate() {
        backend
            .validate_destination(lease.desc(), &upload.textures[plane])
            .map_err(|source| UploadError::Destination { plane, source })?;
    }

    let mut regions = Vec::with_capacity(damage.len());
    let mut copies = 0;

    for (plane, lease) in leases.iter().enumerate() {
        regions.clear();
        if !damage.is_empty() {
            let plane_size = frame.plane_size(plane);
            let bounds = lease.desc().bounds();
            regions.extend(
                damage
                    .iter()
                    .filter_map(|rect| rect.scale(frame.dimensions(), plane_size).intersect(&bounds)),
            );
            // Damage entirely outside this plane
            if regions.is_empty() {
                continue;
            }
        }

        let issued = backend
            .copy_to_texture(lease.id(), lease.desc(), &upload.textures[plane], &regions)
            .map_err(|source| UploadError::CopyInterrupted {
                plane,
                copies,
                source,
            })?;
        copies += issued;
    }

    Ok(copies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::SizeNotifier;
    use nvr_gpu::{CopyRecord, HostBackend};
    use nvr_video::{FrameView, PixelFormat, TextureDesc, VideoKind, VideoRect};

    struct Rig {
        host: HostBackend,
        device: Device,
        dirty: Arc<DirtySet>,
        pool: Arc<FramePool>,
        stream: Arc<StreamDispatcher>,
    }

    fn rig() -> Rig {
        let host = HostBackend::new();
        let device = Device {
            backend: Box::new(host.clone()),
            staging: StagingPool::new(3, 100),
        };
        let dirty = Arc::new(DirtySet::new());
        let pool = Arc::new(FramePool::new(8, 16));
        let stream = Arc::new(StreamDispatcher::new(
            StreamId(1),
            pool.clone(),
            dirty.clone(),
            Arc::new(SizeNotifier::new()),
        ));
        Rig {
            host,
            device,
            dirty,
            pool,
            stream,
        }
    }

    impl Rig {
        fn tick(&mut self, tick: u64) -> TickReport {
            let stream = self.stream.clone();
            run_tick(tick, &mut self.device, &self.dirty, &self.pool, move |id| {
                (id == stream.id()).then(|| stream.clone())
            })
        }

        fn bind_i420(&self, width: u32, height: u32) -> [TextureDesc; 3] {
            let (cw, ch) = VideoKind::I420.plane_size(1, width, height);
            let y = self.host.create_texture(PixelFormat::R8, width, height);
            let u = self.host.create_texture(PixelFormat::R8, cw, ch);
            let v = self.host.create_texture(PixelFormat::R8, cw, ch);
            let textures = [
                TextureDesc::new(y, width, height),
                TextureDesc::new(u, cw, ch),
                TextureDesc::new(v, cw, ch),
            ];
            self.stream.set_textures(VideoKind::I420, &textures).unwrap();
            textures
        }
    }

    #[test]
    fn test_i420_upload() {
        let mut rig = rig();
        let textures = rig.bind_i420(64, 48);

        let y: Vec<u8> = (0..64 * 48).map(|i| (i % 251) as u8).collect();
        let u = vec![100u8; 32 * 24];
        let v = vec![200u8; 32 * 24];
        rig.stream
            .submit(&FrameView::i420(64, 48, [y.as_slice(), &u, &v], [64, 32, 32], None));

        let report = rig.tick(0);
        assert_eq!(report.drained, 1);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.copies, 3);

        let luma = rig.host.texture(textures[0].texture).unwrap();
        assert_eq!(luma.data, y);
        let chroma = rig.host.texture(textures[2].texture).unwrap();
        assert!(chroma.data.iter().all(|&b| b == 200));

        assert_eq!(rig.pool.stats().outstanding, 0);
        assert_eq!(rig.device.staging.stats().unsafe_pending, 3);
    }

    #[test]
    fn test_padded_source_stride() {
        let mut rig = rig();
        let texture = rig.host.create_texture(PixelFormat::Bgra8, 3, 2);
        rig.stream
            .set_textures(VideoKind::Argb, &[TextureDesc::new(texture, 3, 2)])
            .unwrap();

        // 12 bytes of pixels on a 16 byte stride
        let mut data = vec![0xEEu8; 16 + 12];
        data[..12].fill(1);
        data[16..].fill(2);
        rig.stream.submit(&FrameView::argb(3, 2, &data, 16));

        assert_eq!(rig.tick(0).uploaded, 1);
        let tex = rig.host.texture(texture).unwrap();
        assert_eq!(tex.row(0), &[1u8; 12]);
        assert_eq!(tex.row(1), &[2u8; 12]);
    }

    #[test]
    fn test_dirty_rects_scaled_per_plane() {
        let mut rig = rig();
        rig.bind_i420(64, 64);

        let y = vec![1u8; 64 * 64];
        let uv = vec![2u8; 32 * 32];
        let damage = [VideoRect::new(10, 10, 5, 5)];
        let frame = FrameView::i420(64, 64, [y.as_slice(), &uv, &uv], [64, 32, 32], None)
            .with_dirty_rects(&damage);
        rig.stream.submit(&frame);

        rig.tick(0);
        let regions: Vec<VideoRect> = rig.host.copies().iter().map(|c| c.region).collect();
        assert_eq!(
            regions,
            vec![
                VideoRect::new(10, 10, 5, 5),
                VideoRect::new(5, 5, 3, 3),
                VideoRect::new(5, 5, 3, 3),
            ]
        );
    }

    #[test]
    fn test_size_mismatch_skips_stream() {
        let mut rig = rig();
        let y = rig.host.create_texture(PixelFormat::R8, 16, 16);
        // Chroma textures bound at the wrong size
        let bad = rig.host.create_texture(PixelFormat::R8, 16, 16);
        rig.stream
            .set_textures(
                VideoKind::I420,
                &[
                    TextureDesc::new(y, 16, 16),
                    TextureDesc::new(bad, 16, 16),
                    TextureDesc::new(bad, 16, 16),
                ],
            )
            .unwrap();

        let luma = vec![0u8; 256];
        let chroma = vec![0u8; 64];
        rig.stream
            .submit(&FrameView::i420(16, 16, [luma.as_slice(), &chroma, &chroma], [16, 8, 8], None));

        let report = rig.tick(0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.copies, 0);
        assert!(rig.host.copies().is_empty(), "no partial update");
        assert_eq!(rig.pool.stats().outstanding, 0);
        assert_eq!(rig.stream.stats().upload_failures, 1);
    }

    #[test]
    fn test_staging_failure_is_not_fatal() {
        let mut rig = rig();
        rig.bind_i420(16, 16);
        rig.host.set_fail_creates(true);

        let luma = vec![0u8; 256];
        let chroma = vec![0u8; 64];
        let frame = FrameView::i420(16, 16, [luma.as_slice(), &chroma, &chroma], [16, 8, 8], None);
        rig.stream.submit(&frame);
        assert_eq!(rig.tick(0).failed, 1);

        rig.host.set_fail_creates(false);
        rig.stream.submit(&frame);
        let report = rig.tick(1);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.copies, 3);
    }

    #[test]
    fn test_map_failure_releases_leases() {
        let mut rig = rig();
        rig.bind_i420(16, 16);
        rig.host.set_fail_maps(true);

        let luma = vec![0u8; 256];
        let chroma = vec![0u8; 64];
        rig.stream
            .submit(&FrameView::i420(16, 16, [luma.as_slice(), &chroma, &chroma], [16, 8, 8], None));

        assert_eq!(rig.tick(0).failed, 1);
        let stats = rig.device.staging.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.unsafe_pending, 1);
    }

    #[test]
    fn test_unknown_stream_skipped() {
        let mut rig = rig();
        rig.dirty.insert(StreamId(42));

        let report = rig.tick(0);
        assert_eq!(report.drained, 1);
        assert_eq!(report.skipped, 1);
        assert!(rig.dirty.is_empty());
    }

    #[test]
    fn test_copies_target_bound_textures() {
        let mut rig = rig();
        let textures = rig.bind_i420(8, 8);

        let luma = vec![0u8; 64];
        let chroma = vec![0u8; 16];
        rig.stream
            .submit(&FrameView::i420(8, 8, [luma.as_slice(), &chroma, &chroma], [8, 4, 4], None));
        rig.tick(0);

        let targets: Vec<_> = rig.host.copies().iter().map(|c: &CopyRecord| c.texture).collect();
        assert_eq!(
            targets,
            textures.iter().map(|t| t.texture).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_missing_destination_blocks_every_plane() {
        let mut rig = rig();
        let textures = rig.bind_i420(16, 16);
        assert!(rig.host.destroy_texture(textures[2].texture));

        let luma = vec![9u8; 256];
        let chroma = vec![9u8; 64];
        rig.stream
            .submit(&FrameView::i420(16, 16, [luma.as_slice(), &chroma, &chroma], [16, 8, 8], None));

        let report = rig.tick(0);
        assert_eq!((report.failed, report.copies), (1, 0));
        assert!(rig.host.copies().is_empty(), "no plane updated");
        let y = rig.host.texture(textures[0].texture).unwrap();
        assert!(y.data.iter().all(|&b| b == 0));
        assert_eq!(rig.device.staging.stats().leased, 0);
        assert_eq!(rig.pool.stats().outstanding, 0);
    }

    #[test]
    fn test_interrupted_copy_counts_issued_regions() {
        let mut rig = rig();
        let textures = rig.bind_i420(16, 16);
        rig.host.set_fail_copies_to(Some(textures[2].texture));

        let luma = vec![0u8; 256];
        let chroma = vec![0u8; 64];
        rig.stream
            .submit(&FrameView::i420(16, 16, [luma.as_slice(), &chroma, &chroma], [16, 8, 8], None));

        let report = rig.tick(0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.copies, rig.host.copies().len());
        assert_eq!(report.copies, 2);
        assert_eq!(rig.stream.stats().upload_failures, 1);
    }
}
