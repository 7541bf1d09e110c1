use anyhow::Result;
use apriltag::{families::Family, Detector, DetectorBuilder, Image as AprilImage};
use image::GrayImage;

#[repr(C)]
struct RawDetectorParams {
    nthreads: i32,
    quad_decimate: f32,
    quad_sigma: f32,
    refine_edges: i32,
    decode_sharpening: f64,
    debug: i32,
}

/// One detected tag, before pose interpretation. Lives for a single frame.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub id: usize,
    pub center: [f64; 2],
    pub corners: [[f64; 2]; 4],
}

/// tag36h11 detector tuned for the simulated camera feed.
pub struct TagDetector {
    inner: Detector,
}

impl TagDetector {
    pub fn new(nthreads: i32) -> Result<Self> {
        let detector = build_inner_detector(nthreads)?;
        Ok(Self { inner: detector })
    }

    /// Runs detection on one grayscale frame. An empty list is a normal
    /// result, not an error.
    pub fn detect(&mut self, gray: &GrayImage) -> Result<Vec<RawDetection>> {
        let width = gray.width() as usize;
        let height = gray.height() as usize;
        let mut img = unsafe { AprilImage::new_uinit(width, height)? };

        let dst = img.as_mut();
        let src = gray.as_raw();
        if dst.len() == src.len() {
            dst.copy_from_slice(src);
        } else {
            // the apriltag image may be stride-padded; copy what fits
            let copy_len = std::cmp::min(dst.len(), src.len());
            dst[..copy_len].copy_from_slice(&src[..copy_len]);
        }

        let detections = self.inner.detect(&img);

        let mut results = Vec::with_capacity(detections.len());
        for det in detections.iter() {
            let corners = det.corners();
            let center = det.center();
            results.push(RawDetection {
                id: det.id(),
                center: [center[0], center[1]],
                corners: [
                    [corners[0][0], corners[0][1]],
                    [corners[1][0], corners[1][1]],
                    [corners[2][0], corners[2][1]],
                    [corners[3][0], corners[3][1]],
                ],
            });
        }

        Ok(results)
    }
}

fn build_inner_detector(nthreads: i32) -> Result<Detector> {
    let family = Family::tag_36h11();
    let bits: usize = 3;
    let detector = DetectorBuilder::new()
        .add_family_bits(family, bits)
        .build()?;

    // access the underlying C struct to set parameters not exposed by the wrapper
    unsafe {
        let ptr_ptr = &detector as *const Detector as *const *mut RawDetectorParams;
        let raw_ptr = *ptr_ptr;

        if !raw_ptr.is_null() {
            (*raw_ptr).nthreads = nthreads;
            (*raw_ptr).quad_decimate = 2.0;
            (*raw_ptr).quad_sigma = 0.0;
            (*raw_ptr).refine_edges = 1;
            (*raw_ptr).decode_sharpening = 0.25;
        }
    }

    Ok(detector)
}
