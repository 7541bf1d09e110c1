use image::RgbImage;
use minifb::{Key, Window, WindowOptions};

/// Presentation boundary: show a frame, answer "was quit requested".
pub trait DisplaySink {
    fn present(&mut self, img: &RgbImage) -> anyhow::Result<()>;
    fn quit_requested(&self) -> bool;
}

/// Framebuffer window. Quit on `q`, Escape or window close; the update
/// call polls events without blocking, so presentation is paced by the
/// incoming stream rather than the window.
pub struct VideoWindow {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl VideoWindow {
    pub fn open(title: &str, width: u32, height: u32) -> anyhow::Result<Self> {
        let (width, height) = (width as usize, height as usize);
        let mut window = Window::new(title, width, height, WindowOptions::default())?;
        window.limit_update_rate(Some(std::time::Duration::from_millis(1)));
        Ok(Self {
            window,
            buffer: vec![0u32; width * height],
            width,
            height,
        })
    }
}

impl DisplaySink for VideoWindow {
    fn present(&mut self, img: &RgbImage) -> anyhow::Result<()> {
        for (dst, px) in self.buffer.iter_mut().zip(img.pixels()) {
            let [r, g, b] = px.0;
            *dst = (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b);
        }
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)?;
        Ok(())
    }

    fn quit_requested(&self) -> bool {
        !self.window.is_open()
            || self.window.is_key_down(Key::Q)
            || self.window.is_key_down(Key::Escape)
    }
}
