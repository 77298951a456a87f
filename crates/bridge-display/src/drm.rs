//! DRM/KMS display output: mode-set, double-buffered dumb framebuffers,
//! page flipping, letterboxed presentation with optional plane scaling.
//!
//! Frames that fit inside the display are centred 1:1; larger frames are
//! downscaled preserving aspect. A scaling-capable plane takes the
//! centred rectangle in hardware, otherwise a nearest-neighbour software
//! path fills the back buffer and page-flips it in.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use drm::buffer::DrmFourcc;
use drm::control::{
    connector, crtc, framebuffer, plane, Device as ControlDevice, DumbBuffer, Mode,
    PageFlipFlags,
};
use drm::Device;

use bridge_convert::{ColorInfo, PixelFormat};

use crate::DisplayError;

const MAX_DISPLAYS: usize = 3;
/// One 60 Hz frame period, the window to drain the flip event.
const FLIP_WAIT: Duration = Duration::from_micros(16_667);

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// One connector as shown to the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub id: usize,
    /// `HDMI-A-1` style connector name.
    pub connector: String,
    pub connected: bool,
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

struct Scanout {
    buffer: DumbBuffer,
    fb: framebuffer::Handle,
    width: u32,
    height: u32,
    pitch: u32,
}

struct OpenState {
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    saved: Option<crtc::Info>,
    fbs: Vec<Scanout>,
    /// Source framebuffers at stream resolution for the HW scaling path.
    src_fbs: [Option<Scanout>; 2],
    plane: Option<plane::Handle>,
    current: usize,
    display_id: usize,
}

pub struct DrmDisplay {
    card: Card,
    has_universal_planes: bool,
    has_atomic: bool,
    connectors: Vec<connector::Handle>,
    open: Option<OpenState>,
    /// Scratch for UYVY -> BGRA before scaling.
    convert: Vec<u8>,
}

impl DrmDisplay {
    /// Open the first accessible DRM card and become master.
    pub fn open_card() -> Result<Self, DisplayError> {
        let mut last_error = None;
        for index in 0..4 {
            let path = format!("/dev/dri/card{index}");
            match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(&path)
            {
                Ok(file) => {
                    tracing::info!("opened DRM device {path}");
                    return Self::init(Card(file));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(DisplayError::NoCard(
            last_error.map_or_else(|| "no /dev/dri/card*".into(), |e| e.to_string()),
        ))
    }

    fn init(card: Card) -> Result<Self, DisplayError> {
        if card.acquire_master_lock().is_err() {
            tracing::warn!("could not become DRM master, mode setting may fail");
        }

        let dumb = card
            .get_driver_capability(drm::DriverCapability::DumbBuffer)
            .unwrap_or(0);
        if dumb == 0 {
            return Err(DisplayError::NoDumbBuffers);
        }

        let has_universal_planes = card
            .set_client_capability(drm::ClientCapability::UniversalPlanes, true)
            .is_ok();
        let has_atomic = card
            .set_client_capability(drm::ClientCapability::Atomic, true)
            .is_ok();
        tracing::info!(
            "DRM capabilities: universal planes {has_universal_planes}, atomic {has_atomic}"
        );

        let resources = card.resource_handles().map_err(DisplayError::io)?;
        let connectors = resources.connectors().to_vec();

        Ok(Self {
            card,
            has_universal_planes,
            has_atomic,
            connectors,
            open: None,
            convert: Vec::new(),
        })
    }

    /// Enumerate the first three connectors.
    pub fn displays(&self) -> Vec<DisplayInfo> {
        let mut displays = Vec::new();
        for handle in self.connectors.iter().take(MAX_DISPLAYS) {
            let Ok(info) = self.card.get_connector(*handle, false) else {
                continue;
            };
            let connected = info.state() == connector::State::Connected;
            let mode = preferred_mode(info.modes());
            let (width, height, refresh) = mode.map_or((0, 0, 0), |m| {
                let (w, h) = m.size();
                (u32::from(w), u32::from(h), m.vrefresh())
            });
            displays.push(DisplayInfo {
                id: displays.len(),
                connector: format!("{}-{}", interface_name(info.interface()), info.interface_id()),
                connected,
                width,
                height,
                refresh,
            });
        }
        displays
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Current display geometry `(width, height)`, if open.
    pub fn mode_size(&self) -> Option<(u32, u32)> {
        self.open.as_ref().map(|o| {
            let (w, h) = o.mode.size();
            (u32::from(w), u32::from(h))
        })
    }

    /// Mode-set `display_id` and prepare the double buffers.
    pub fn open_display(&mut self, display_id: usize) -> Result<(), DisplayError> {
        self.close_display();

        let handle = *self
            .connectors
            .get(display_id)
            .ok_or(DisplayError::UnknownDisplay(display_id))?;
        let info = self.card.get_connector(handle, false).map_err(DisplayError::io)?;
        if info.state() != connector::State::Connected {
            return Err(DisplayError::NotConnected(display_id));
        }

        // Resolve an encoder and from it a CRTC.
        let resources = self.card.resource_handles().map_err(DisplayError::io)?;
        let encoder_info = info
            .current_encoder()
            .and_then(|e| self.card.get_encoder(e).ok())
            .or_else(|| {
                info.encoders()
                    .iter()
                    .find_map(|e| self.card.get_encoder(*e).ok())
            })
            .ok_or(DisplayError::NoEncoder(display_id))?;
        let crtc_handle = encoder_info
            .crtc()
            .or_else(|| {
                resources
                    .filter_crtcs(encoder_info.possible_crtcs())
                    .first()
                    .copied()
            })
            .ok_or(DisplayError::NoCrtc(display_id))?;

        let mode = preferred_mode(info.modes())
            .copied()
            .ok_or(DisplayError::NoMode(display_id))?;
        let (width, height) = mode.size();
        tracing::info!(
            "display {display_id}: mode {}x{} @ {} Hz",
            width,
            height,
            mode.vrefresh()
        );

        // Save what the CRTC shows now, to put it back on close.
        let saved = self.card.get_crtc(crtc_handle).ok();

        let mut fbs = Vec::with_capacity(2);
        for _ in 0..2 {
            match self.create_scanout(u32::from(width), u32::from(height)) {
                Ok(s) => fbs.push(s),
                Err(e) => {
                    for s in fbs {
                        self.destroy_scanout(s);
                    }
                    return Err(e);
                }
            }
        }

        let plane = if self.has_universal_planes {
            self.find_scaling_plane(crtc_handle, &resources)
        } else {
            None
        };

        let mut state = OpenState {
            connector: handle,
            crtc: crtc_handle,
            mode,
            saved,
            fbs,
            src_fbs: [None, None],
            plane,
            current: 0,
            display_id,
        };

        // Initial mode-set on a cleared buffer.
        self.clear_scanouts(&mut state);
        self.card
            .set_crtc(
                crtc_handle,
                Some(state.fbs[0].fb),
                (0, 0),
                &[handle],
                Some(mode),
            )
            .map_err(|e| {
                DisplayError::ModeSet(format!("display {display_id}: {e}"))
            })?;

        self.open = Some(state);
        Ok(())
    }

    /// Present one frame. `format` must be BGRA (the NDI receiver's
    /// output) or UYVY, which is converted before scaling.
    pub fn display_frame(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> Result<(), DisplayError> {
        let Some(mut state) = self.open.take() else {
            return Err(DisplayError::NotOpen);
        };
        let result = self.present(&mut state, data, width, height, stride, format);
        self.open = Some(state);
        result
    }

    fn present(
        &mut self,
        state: &mut OpenState,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> Result<(), DisplayError> {
        if width == 0 || height == 0 {
            return Err(DisplayError::BadFrame("zero dimension"));
        }

        // Normalize to tightly packed BGRA once, if needed.
        let bgra: &[u8] = match format {
            PixelFormat::Bgra => {
                let need = stride as usize * (height as usize - 1) + width as usize * 4;
                if data.len() < need {
                    return Err(DisplayError::BadFrame("short BGRA payload"));
                }
                data
            }
            PixelFormat::Uyvy => {
                self.convert
                    .resize(bridge_convert::bgra_size(width, height), 0);
                bridge_convert::convert_to_bgra(
                    data,
                    width,
                    height,
                    stride,
                    PixelFormat::Uyvy,
                    ColorInfo::detect(width, height),
                    &mut self.convert,
                )
                .map_err(|_| DisplayError::BadFrame("UYVY conversion failed"))?;
                &self.convert
            }
            _ => return Err(DisplayError::BadFrame("unsupported display format")),
        };
        let bgra_stride = if format == PixelFormat::Bgra {
            stride
        } else {
            width * 4
        };

        let (mode_w, mode_h) = state.mode.size();
        let target = fit_rect(width, height, u32::from(mode_w), u32::from(mode_h));

        if state.plane.is_some() {
            match self.present_hw(state, bgra, width, height, bgra_stride, target) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("hardware scaling failed ({e}), falling back to software");
                    state.plane = None;
                }
            }
        }
        self.present_sw(state, bgra, width, height, bgra_stride, target)
    }

    /// Copy the frame into a source FB at native size and let the plane
    /// scale it into the centred rectangle.
    fn present_hw(
        &self,
        state: &mut OpenState,
        bgra: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        target: Rect,
    ) -> Result<(), DisplayError> {
        let next = state.current ^ 1;

        // (Re)create the source framebuffer at the stream's resolution.
        let recreate = match &state.src_fbs[next] {
            Some(s) => s.width != width || s.height != height,
            None => true,
        };
        if recreate {
            if let Some(old) = state.src_fbs[next].take() {
                self.destroy_scanout(old);
            }
            state.src_fbs[next] = Some(self.create_scanout(width, height)?);
        }
        let src = state.src_fbs[next].as_mut().expect("just created");

        {
            let pitch = src.pitch as usize;
            let mut map = self
                .card
                .map_dumb_buffer(&mut src.buffer)
                .map_err(DisplayError::io)?;
            let dst = map.as_mut();
            for y in 0..height as usize {
                let src_row = &bgra[y * stride as usize..y * stride as usize + width as usize * 4];
                dst[y * pitch..y * pitch + width as usize * 4].copy_from_slice(src_row);
            }
        }

        let plane = state.plane.expect("checked by caller");
        self.card
            .set_plane(
                plane,
                state.crtc,
                Some(src.fb),
                0,
                (target.x, target.y, target.w, target.h),
                (0, 0, width << 16, height << 16),
            )
            .map_err(|e| DisplayError::ModeSet(format!("set_plane: {e}")))?;
        state.current = next;
        Ok(())
    }

    /// Nearest-neighbour scale into the back buffer, then flip.
    fn present_sw(
        &self,
        state: &mut OpenState,
        bgra: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        target: Rect,
    ) -> Result<(), DisplayError> {
        let next = state.current ^ 1;
        let fb_handle = state.fbs[next].fb;
        {
            let scanout = &mut state.fbs[next];
            let pitch = scanout.pitch as usize;
            let mut map = self
                .card
                .map_dumb_buffer(&mut scanout.buffer)
                .map_err(DisplayError::io)?;
            let dst = map.as_mut();
            // Black bars around the target rectangle.
            dst.fill(0);
            scale_into(
                bgra,
                width,
                height,
                stride,
                dst,
                pitch,
                target,
            );
        }

        // Async flip when the driver offers one (atomic preferred, the
        // legacy ioctl otherwise); a refusal means a full mode-set.
        let flip = if self.has_atomic || self.has_universal_planes {
            self.card
                .page_flip(state.crtc, fb_handle, PageFlipFlags::EVENT, None)
        } else {
            self.card
                .page_flip(state.crtc, fb_handle, PageFlipFlags::empty(), None)
        };
        match flip {
            Ok(()) => self.drain_flip_event(),
            Err(_) => {
                // No async flip available: legacy full mode-set.
                self.card
                    .set_crtc(
                        state.crtc,
                        Some(fb_handle),
                        (0, 0),
                        &[state.connector],
                        Some(state.mode),
                    )
                    .map_err(|e| DisplayError::ModeSet(format!("set_crtc: {e}")))?;
            }
        }
        state.current = next;
        Ok(())
    }

    /// Wait up to one frame period for the flip completion event.
    fn drain_flip_event(&self) {
        let mut pfd = libc::pollfd {
            fd: self.card.0.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: polling our own open fd.
        let ready = unsafe { libc::poll(&mut pfd, 1, FLIP_WAIT.as_millis() as i32) };
        if ready > 0 {
            let _ = self.card.receive_events();
        }
    }

    /// Zero both scanout buffers.
    pub fn clear(&mut self) {
        if let Some(mut state) = self.open.take() {
            self.clear_scanouts(&mut state);
            self.open = Some(state);
        }
    }

    fn clear_scanouts(&self, state: &mut OpenState) {
        for scanout in &mut state.fbs {
            if let Ok(mut map) = self.card.map_dumb_buffer(&mut scanout.buffer) {
                map.as_mut().fill(0);
            }
        }
    }

    /// Restore the saved CRTC and free every buffer.
    pub fn close_display(&mut self) {
        let Some(state) = self.open.take() else {
            return;
        };

        if let Some(saved) = &state.saved {
            let _ = self.card.set_crtc(
                state.crtc,
                saved.framebuffer(),
                saved.position(),
                &[state.connector],
                saved.mode(),
            );
        }
        for scanout in state.fbs {
            self.destroy_scanout(scanout);
        }
        for scanout in state.src_fbs.into_iter().flatten() {
            self.destroy_scanout(scanout);
        }
        tracing::info!("display {} closed", state.display_id);
    }

    fn create_scanout(&self, width: u32, height: u32) -> Result<Scanout, DisplayError> {
        let buffer = self
            .card
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)
            .map_err(DisplayError::io)?;
        let fb = match self.card.add_framebuffer(&buffer, 24, 32) {
            Ok(fb) => fb,
            Err(e) => {
                let _ = self.card.destroy_dumb_buffer(buffer);
                return Err(DisplayError::io(e));
            }
        };
        let pitch = buffer.pitch();
        Ok(Scanout {
            buffer,
            fb,
            width,
            height,
            pitch,
        })
    }

    fn destroy_scanout(&self, scanout: Scanout) {
        let _ = self.card.destroy_framebuffer(scanout.fb);
        let _ = self.card.destroy_dumb_buffer(scanout.buffer);
    }

    /// Find a primary or overlay plane bound to our CRTC; those are the
    /// scaling-capable ones on Intel.
    fn find_scaling_plane(
        &self,
        crtc_handle: crtc::Handle,
        resources: &drm::control::ResourceHandles,
    ) -> Option<plane::Handle> {
        let planes = self.card.plane_handles().ok()?;
        for handle in planes {
            let Ok(info) = self.card.get_plane(handle) else {
                continue;
            };
            let compatible = resources
                .filter_crtcs(info.possible_crtcs())
                .contains(&crtc_handle);
            if !compatible {
                continue;
            }
            if let Some(kind) = self.plane_type(handle) {
                // 0 = overlay, 1 = primary.
                if kind <= 1 {
                    tracing::info!("using plane {handle:?} for hardware scaling");
                    return Some(handle);
                }
            }
        }
        tracing::warn!("no scaling-capable plane, software path selected");
        None
    }

    fn plane_type(&self, handle: plane::Handle) -> Option<u64> {
        let props = self.card.get_properties(handle).ok()?;
        let (ids, values) = props.as_props_and_values();
        for (id, value) in ids.iter().zip(values) {
            let Ok(info) = self.card.get_property(*id) else {
                continue;
            };
            if info.name().to_bytes() == b"type" {
                return Some(*value);
            }
        }
        None
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        self.close_display();
        let _ = self.card.release_master_lock();
    }
}

/// Placement of the frame on the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// Compute where the frame lands: centred 1:1 when it fits, otherwise
/// downscaled to the display preserving aspect (letterboxed or
/// pillarboxed).
#[must_use]
pub fn fit_rect(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Rect {
    if src_w <= dst_w && src_h <= dst_h {
        return Rect {
            x: ((dst_w - src_w) / 2) as i32,
            y: ((dst_h - src_h) / 2) as i32,
            w: src_w,
            h: src_h,
        };
    }
    // Compare aspects without floats: src_w/src_h vs dst_w/dst_h.
    if u64::from(src_w) * u64::from(dst_h) > u64::from(dst_w) * u64::from(src_h) {
        let h = (u64::from(dst_w) * u64::from(src_h) / u64::from(src_w)) as u32;
        Rect {
            x: 0,
            y: ((dst_h - h) / 2) as i32,
            w: dst_w,
            h,
        }
    } else {
        let w = (u64::from(dst_h) * u64::from(src_w) / u64::from(src_h)) as u32;
        Rect {
            x: ((dst_w - w) / 2) as i32,
            y: 0,
            w,
            h: dst_h,
        }
    }
}

/// Nearest-neighbour copy of `src` (BGRA) into the target rectangle of
/// an XRGB8888 scanout buffer.
fn scale_into(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    src_stride: u32,
    dst: &mut [u8],
    dst_pitch: usize,
    target: Rect,
) {
    for dy in 0..target.h as usize {
        let sy = dy * src_h as usize / target.h as usize;
        let src_row = &src[sy * src_stride as usize..];
        let dst_row =
            &mut dst[(target.y as usize + dy) * dst_pitch + target.x as usize * 4..];
        for dx in 0..target.w as usize {
            let sx = dx * src_w as usize / target.w as usize;
            let pixel = &src_row[sx * 4..sx * 4 + 4];
            let out = &mut dst_row[dx * 4..dx * 4 + 4];
            out[0] = pixel[0];
            out[1] = pixel[1];
            out[2] = pixel[2];
            out[3] = 0xFF;
        }
    }
}

fn preferred_mode(modes: &[Mode]) -> Option<&Mode> {
    modes
        .iter()
        .find(|m| m.mode_type().contains(drm::control::ModeTypeFlags::PREFERRED))
        .or_else(|| modes.first())
}

fn interface_name(interface: connector::Interface) -> &'static str {
    use connector::Interface;
    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "S-Video",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DisplayPort",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_frame_is_centred_unscaled() {
        // A 720p frame on a 1080p display sits at (320, 180) at 1:1.
        let rect = fit_rect(1280, 720, 1920, 1080);
        assert_eq!(rect, Rect { x: 320, y: 180, w: 1280, h: 720 });
    }

    #[test]
    fn wider_frame_letterboxes() {
        // 2x display width, 21:9-ish content on 16:9.
        let rect = fit_rect(3840, 1600, 1920, 1080);
        assert_eq!(rect.w, 1920);
        assert_eq!(rect.h, 800);
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 140);
    }

    #[test]
    fn taller_frame_pillarboxes() {
        let rect = fit_rect(1080, 1920, 1920, 1080);
        assert_eq!(rect.h, 1080);
        assert_eq!(rect.w, 607);
        assert_eq!(rect.y, 0);
        assert!(rect.x > 0);
    }

    #[test]
    fn exact_fit_fills() {
        let rect = fit_rect(1920, 1080, 1920, 1080);
        assert_eq!(rect, Rect { x: 0, y: 0, w: 1920, h: 1080 });
    }

    #[test]
    fn letterboxed_borders_stay_black() {
        // S4 shape: 1280x720 BGRA frame into a 1920x1080 buffer.
        let (src_w, src_h) = (1280u32, 720u32);
        let (dst_w, dst_h) = (1920usize, 1080usize);
        let src = vec![0xABu8; src_w as usize * src_h as usize * 4];
        let pitch = dst_w * 4;
        let mut dst = vec![0u8; pitch * dst_h];

        let target = fit_rect(src_w, src_h, dst_w as u32, dst_h as u32);
        assert_eq!(target, Rect { x: 320, y: 180, w: 1280, h: 720 });
        scale_into(&src, src_w, src_h, src_w * 4, &mut dst, pitch, target);

        // Everything outside the rectangle is zero.
        for y in 0..dst_h {
            for x in 0..dst_w {
                let inside = (320..1600).contains(&x) && (180..900).contains(&y);
                let px = &dst[y * pitch + x * 4..y * pitch + x * 4 + 4];
                if inside {
                    assert_eq!(&px[..3], &[0xAB, 0xAB, 0xAB]);
                    assert_eq!(px[3], 0xFF);
                } else {
                    assert_eq!(px, &[0, 0, 0, 0]);
                }
            }
        }
    }

    #[test]
    fn scaling_picks_nearest_source_pixel() {
        // 2x1 source: left red-ish, right green-ish; scaled to 4x1.
        let src = [1u8, 2, 3, 255, 9, 8, 7, 255];
        let mut dst = vec![0u8; 4 * 4];
        scale_into(&src, 2, 1, 8, &mut dst, 16, Rect { x: 0, y: 0, w: 4, h: 1 });
        assert_eq!(&dst[0..3], &[1, 2, 3]);
        assert_eq!(&dst[4..7], &[1, 2, 3]);
        assert_eq!(&dst[8..11], &[9, 8, 7]);
        assert_eq!(&dst[12..15], &[9, 8, 7]);
    }
}
