use std::sync::Arc;

use pole_overlay_core::detection::{BoundingBox, DetectionFrame, Label};
use pole_overlay_core::playback::Session;
use pole_overlay_core::rendering::palette::IRON_POLE;
use pole_overlay_core::rendering::{OverlayOptions, PixelSize, RasterSurface, Size};
use pole_overlay_core::timing::Fps;

fn snapshot(dpr: f64) -> Session<RasterSurface> {
    let mut session = Session::new(
        RasterSurface::new(),
        Fps::new(25.0).unwrap(),
        OverlayOptions::default(),
        Size::new(200.0, 100.0),
    );
    session.set_device_pixel_ratio(dpr);
    session.load_metadata(PixelSize::new(200, 100), 10.0);
    session.set_detections(Arc::new(vec![DetectionFrame {
        frame_index: 0,
        time: Some(0.0),
        boxes: vec![BoundingBox::new(1, [20.0, 40.0, 120.0, 90.0], Label::IronPole)],
    }]));
    session.settle();
    session
}

#[test]
fn test_box_outline_and_caption_strip_are_rasterized() {
    let session = snapshot(1.0);
    let img = session.overlay().surface().unwrap().image();
    let red = IRON_POLE.to_rgba();

    assert_eq!(img.dimensions(), (200, 100));
    // Two-pixel outline straddling x = 20.
    assert_eq!(img.get_pixel(19, 60).0, red);
    assert_eq!(img.get_pixel(20, 60).0, red);
    assert_eq!(img.get_pixel(21, 60).0[3], 0);
    // Interior untouched.
    assert_eq!(img.get_pixel(70, 65).0[3], 0);
    // Caption strip above the top edge.
    assert_eq!(img.get_pixel(22, 30).0, red);
    // White caption text inside the strip: bottom bar of the leading "1".
    assert_eq!(img.get_pixel(24, 34).0, [255, 255, 255, 255]);
    assert_eq!(img.get_pixel(150, 30).0[3], 0);
}

#[test]
fn test_high_density_snapshot_has_scaled_buffer() {
    let session = snapshot(2.0);
    let img = session.overlay().surface().unwrap().image();
    let red = IRON_POLE.to_rgba();

    assert_eq!(img.dimensions(), (400, 200));
    assert_eq!(img.get_pixel(40, 120).0, red);
    assert_eq!(img.get_pixel(43, 120).0[3], 0);
}

#[test]
fn test_snapshot_png_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame-0000.png");
    let session = snapshot(1.0);
    session.overlay().surface().unwrap().save(&path).unwrap();

    let decoded = image::open(&path).unwrap().to_rgba8();
    assert_eq!(&decoded, session.overlay().surface().unwrap().image());
}
