//! End-to-end pipeline tests against the null backend: every pass is
//! generated and "dispatched" for real, and the recorded GLSL is inspected
//! instead of pixels.

use std::sync::Arc;

use opal_core::options::{DitherMode, DitherOpts, RenderOptions, ScalerOpts, ToneCurve};
use opal_core::{
    ColorDescription, Colorspace, Levels, Light, PlaneType, Primaries, TextureDesc,
    TextureFormat, Transfer,
};
use opal_render::pipeline::{FramePlane, FrameTiming, RenderTarget, Renderer, VideoFrame};
use opal_shader::{vulkan_class_profile, Backend, NullBackend, ShaderSource};

fn test_backend() -> (Arc<NullBackend>, Arc<dyn Backend>) {
    let null = Arc::new(NullBackend::new(vulkan_class_profile()));
    let backend: Arc<dyn Backend> = null.clone();
    (null, backend)
}

/// A flat gray 4:2:0 frame.
fn yuv_frame(id: u64, w: u32, h: u32) -> VideoFrame {
    let plane = |pt, pw: u32, ph: u32, value: u8| FramePlane {
        plane: pt,
        w: pw,
        h: ph,
        format: TextureFormat::R8,
        data: vec![value; (pw * ph) as usize],
    };
    VideoFrame {
        id,
        planes: vec![
            plane(PlaneType::Luma, w, h, 0x80),
            plane(PlaneType::Chroma, w / 2, h / 2, 0x80),
            plane(PlaneType::Chroma, w / 2, h / 2, 0x80),
        ],
        color: ColorDescription::default(),
        bit_depth: 8,
    }
}

fn hdr_frame(id: u64, w: u32, h: u32) -> VideoFrame {
    let mut frame = yuv_frame(id, w, h);
    frame.color = ColorDescription {
        space: Colorspace::Bt2020Ncl,
        levels: Levels::Limited,
        primaries: Primaries::Bt2020,
        transfer: Transfer::Pq,
        light: Light::Display,
        sig_peak: 0.0,
    };
    frame
}

fn make_target(backend: &Arc<dyn Backend>, w: u32, h: u32) -> RenderTarget {
    let tex = backend
        .create_texture(&TextureDesc::target(w, h, TextureFormat::Rgba8))
        .unwrap();
    RenderTarget {
        tex,
        w,
        h,
        format: TextureFormat::Rgba8,
        depth: 8,
    }
}

fn trivial_options() -> RenderOptions {
    RenderOptions {
        scale: ScalerOpts::named("bilinear"),
        dscale: None,
        dither: DitherOpts {
            mode: DitherMode::None,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn all_text(sources: &[ShaderSource]) -> String {
    let mut out = String::new();
    for s in sources {
        for part in [&s.vertex, &s.fragment, &s.compute] {
            if let Some(text) = part {
                out.push_str(text);
                out.push('\n');
            }
        }
    }
    out
}

#[test]
fn test_trivial_options_take_the_dumb_path() {
    let (null, backend) = test_backend();
    let mut renderer = Renderer::new(backend.clone(), trivial_options()).unwrap();
    assert!(renderer.is_dumb());

    let target = make_target(&backend, 1920, 1080);
    let result = renderer.render_frame(&yuv_frame(1, 640, 360), &target, None);
    assert!(!result.broken);
    assert!(!result.is_interpolated);

    // One pass, one program: upload, convert and stretch in a single draw.
    let sources = null.compiled_sources();
    assert_eq!(sources.len(), 1);
    let frag = sources[0].fragment.as_deref().unwrap();
    assert!(frag.contains("texture(texture0, texcoord0)"));

    // A second frame reuses the compiled program.
    let result = renderer.render_frame(&yuv_frame(2, 640, 360), &target, None);
    assert!(!result.broken);
    assert_eq!(null.compiled_sources().len(), 1);
}

#[test]
fn test_hdr_to_sdr_compiles_tone_mapping() {
    let (null, backend) = test_backend();
    let mut opts = RenderOptions::default();
    opts.tone.curve = ToneCurve::Hable;
    let mut renderer = Renderer::new(backend.clone(), opts).unwrap();
    assert!(!renderer.is_dumb());

    let target = make_target(&backend, 960, 540);
    let result = renderer.render_frame(&hdr_frame(1, 640, 360), &target, None);
    assert!(!result.broken);

    let sources = null.compiled_sources();
    assert!(sources.len() >= 4, "expected a multi-pass chain, got {}", sources.len());
    let text = all_text(&sources);
    // PQ expansion (the m2 exponent) and the hable curve both made it in.
    assert!(text.contains("78.84"), "missing PQ linearization");
    assert!(text.contains("hable("), "missing tone curve");
    // Peak detection promoted color mapping to a compute pass.
    assert!(sources.iter().any(|s| {
        s.compute.as_deref().is_some_and(|c| c.contains("PeakDetect"))
    }));
    // The present pass dithers with the default fruit matrix.
    let last = null.last_program_source().unwrap();
    assert!(last.fragment.as_deref().unwrap().contains("dither_lut"));
}

#[test]
fn test_pass_stats_are_reported_in_order() {
    let (_null, backend) = test_backend();
    let mut renderer = Renderer::new(backend.clone(), RenderOptions::default()).unwrap();
    let target = make_target(&backend, 960, 540);
    let result = renderer.render_frame(&yuv_frame(1, 640, 360), &target, None);
    assert!(!result.broken);
    let names: Vec<_> = result.passes.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names.first().copied(), Some("convert"));
    assert_eq!(names.last().copied(), Some("present"));
}

#[test]
fn test_user_hooks_run_in_order_and_saved_textures_bind() {
    let shader = r#"//!HOOK MAIN
//!DESC doubler
//!SAVE FOO
vec4 hook() { return HOOKED_tex(HOOKED_pos) * 2.345; }

//!HOOK MAIN
//!BIND FOO
//!DESC mixer
vec4 hook() { return HOOKED_texOff(0) + FOO_tex(HOOKED_pos) * 0.123; }
"#;

    let (null, backend) = test_backend();
    let mut opts = trivial_options();
    opts.dumb_mode = Some(false);
    let mut renderer = Renderer::new(backend.clone(), opts).unwrap();
    assert!(!renderer.is_dumb());
    assert_eq!(renderer.set_user_shaders(&[("test.hook".into(), shader.into())]), 2);

    let target = make_target(&backend, 1280, 720);
    let result = renderer.render_frame(&yuv_frame(1, 640, 360), &target, None);
    assert!(!result.broken);

    let sources = null.compiled_sources();
    let find = |needle: &str| {
        sources.iter().position(|s| {
            s.fragment.as_deref().is_some_and(|f| f.contains(needle))
        })
    };
    let first = find("2.345").expect("first hook pass missing");
    let second = find("0.123").expect("second hook pass missing");
    assert!(first < second);
    // The second pass can sample the saved FOO image.
    let frag = sources[second].fragment.as_deref().unwrap();
    assert!(frag.contains("vec4 FOO_tex(vec2 pos)"));
}

#[test]
fn test_failed_hook_condition_skips_only_the_hook() {
    let shader = r#"//!HOOK MAIN
//!WHEN NOSUCH.w 100 >
vec4 hook() { return HOOKED_tex(HOOKED_pos) * 7.777; }
"#;

    let (null, backend) = test_backend();
    let mut opts = trivial_options();
    opts.dumb_mode = Some(false);
    let mut renderer = Renderer::new(backend.clone(), opts).unwrap();
    assert_eq!(renderer.set_user_shaders(&[("bad.hook".into(), shader.into())]), 1);

    let target = make_target(&backend, 1280, 720);
    let result = renderer.render_frame(&yuv_frame(1, 640, 360), &target, None);
    // The frame still renders; the hook body never compiled.
    assert!(!result.broken);
    assert!(!all_text(&null.compiled_sources()).contains("7.777"));
}

#[test]
fn test_broken_frame_is_reported() {
    let backend: Arc<dyn Backend> =
        Arc::new(NullBackend::failing_compiles(vulkan_class_profile()));
    let mut renderer = Renderer::new(backend.clone(), RenderOptions::default()).unwrap();
    let target = make_target(&backend, 960, 540);
    let result = renderer.render_frame(&yuv_frame(1, 640, 360), &target, None);
    assert!(result.broken);
    assert!(!result.is_interpolated);

    // Every later frame hits the same dead cache entries and must keep
    // reporting broken, never a silent no-op success.
    for id in 2..12 {
        let result = renderer.render_frame(&yuv_frame(id, 640, 360), &target, None);
        assert!(result.broken, "frame {} silently reported healthy", id);
    }
}

#[test]
fn test_interpolation_mixes_once_two_frames_exist() {
    let (null, backend) = test_backend();
    let mut opts = trivial_options();
    opts.interpolation.enabled = true;
    opts.interpolation.tscale = ScalerOpts::named("oversample");
    let mut renderer = Renderer::new(backend.clone(), opts).unwrap();
    assert!(!renderer.is_dumb());

    let target = make_target(&backend, 1280, 720);
    let timing = FrameTiming {
        vsync_offset: 10.0,
        ideal_frame_duration: 20.0,
    };

    // One frame in the ring: nothing to mix with yet.
    let result = renderer.render_frame(&yuv_frame(1, 640, 360), &target, Some(&timing));
    assert!(!result.broken);
    assert!(!result.is_interpolated);

    let result = renderer.render_frame(&yuv_frame(2, 640, 360), &target, Some(&timing));
    assert!(!result.broken);
    assert!(result.is_interpolated);
    assert!(all_text(&null.compiled_sources()).contains("inter_coeff"));

    // A repeated vsync against the same frame reuses the parked surfaces.
    let result = renderer.render_frame(&yuv_frame(2, 640, 360), &target, Some(&timing));
    assert!(!result.broken);
    assert!(result.is_interpolated);
}

#[test]
fn test_seek_drops_interpolation_surfaces() {
    let (_null, backend) = test_backend();
    let mut opts = trivial_options();
    opts.interpolation.enabled = true;
    opts.interpolation.tscale = ScalerOpts::named("oversample");
    let mut renderer = Renderer::new(backend.clone(), opts).unwrap();

    let target = make_target(&backend, 1280, 720);
    let timing = FrameTiming {
        vsync_offset: 10.0,
        ideal_frame_duration: 20.0,
    };
    for id in [10, 11] {
        renderer.render_frame(&yuv_frame(id, 640, 360), &target, Some(&timing));
    }
    // A jump backwards must not blend the stale future frames.
    let result = renderer.render_frame(&yuv_frame(3, 640, 360), &target, Some(&timing));
    assert!(!result.broken);
    assert!(!result.is_interpolated);
}
