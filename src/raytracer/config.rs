use std::path::PathBuf;

use glam::UVec2;

use crate::raytracer::error::{FrameBufferError, Result};
use crate::raytracer::framebuffer::{min_adaptive_frames, ChannelFlags, ColorFormat, FrameBufferDesc, DEFAULT_RENDER_TASK_SIZE};
use crate::raytracer::imageop::ImageOpDesc;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveSamplingConfig {
    /// Tasks whose error is at or below this stop receiving samples. Zero
    /// disables adaptive stopping.
    pub error_threshold: f32,
    pub samples_per_pixel: u32,
    pub max_frames: u32,
}

impl Default for AdaptiveSamplingConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.02,
            samples_per_pixel: 1,
            max_frames: 256,
        }
    }
}

impl AdaptiveSamplingConfig {
    pub fn min_adaptive_frames(&self) -> i32 {
        min_adaptive_frames(self.samples_per_pixel)
    }
}

#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub size: UVec2,
    pub color_format: ColorFormat,
    pub channels: ChannelFlags,
    pub render_task_size: UVec2,
    pub output: PathBuf,
    /// Number of sparse frame buffers composed into the output, 0 renders
    /// straight into the dense buffer.
    pub devices: usize,
    pub image_ops: Vec<String>,
    pub adaptive: AdaptiveSamplingConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            size: UVec2::new(640, 360),
            color_format: ColorFormat::Srgba,
            channels: ChannelFlags::COLOR
                | ChannelFlags::ACCUM
                | ChannelFlags::VARIANCE
                | ChannelFlags::DEPTH
                | ChannelFlags::NORMAL
                | ChannelFlags::ALBEDO,
            render_task_size: DEFAULT_RENDER_TASK_SIZE,
            output: PathBuf::from("output.png"),
            devices: 0,
            image_ops: vec!["tonemapper".to_owned()],
            adaptive: AdaptiveSamplingConfig::default(),
        }
    }
}

impl RenderConfig {
    /// Parses command line flags, starting from the defaults.
    pub fn from_args<I, S>(args: I) -> std::result::Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        let mut ops_given = false;
        let mut args = args.into_iter();

        fn value<S: AsRef<str>>(flag: &str, next: Option<S>) -> std::result::Result<String, String> {
            next.map(|s| s.as_ref().to_owned())
                .ok_or_else(|| format!("missing value for {flag}"))
        }

        fn number<T: std::str::FromStr>(flag: &str, v: &str) -> std::result::Result<T, String> {
            v.parse().map_err(|_| format!("invalid value '{v}' for {flag}"))
        }

        while let Some(arg) = args.next() {
            let flag = arg.as_ref();
            match flag {
                "--size" => {
                    let v = value(flag, args.next())?;
                    let (w, h) = v
                        .split_once('x')
                        .ok_or_else(|| format!("expected WxH for --size, got '{v}'"))?;
                    config.size = UVec2::new(number(flag, w)?, number(flag, h)?);
                }
                "--frames" => config.adaptive.max_frames = number(flag, &value(flag, args.next())?)?,
                "--threshold" => config.adaptive.error_threshold = number(flag, &value(flag, args.next())?)?,
                "--spp" => config.adaptive.samples_per_pixel = number(flag, &value(flag, args.next())?)?,
                "--devices" => config.devices = number(flag, &value(flag, args.next())?)?,
                "--task-size" => {
                    let n: u32 = number(flag, &value(flag, args.next())?)?;
                    config.render_task_size = UVec2::splat(n);
                }
                "--format" => {
                    let v = value(flag, args.next())?;
                    config.color_format = match v.as_str() {
                        "rgba8" => ColorFormat::Rgba8,
                        "srgba" => ColorFormat::Srgba,
                        "rgba32f" => ColorFormat::Rgba32f,
                        other => return Err(format!("unknown color format '{other}'")),
                    };
                }
                "--op" => {
                    if !ops_given {
                        config.image_ops.clear();
                        ops_given = true;
                    }
                    config.image_ops.push(value(flag, args.next())?);
                }
                "--no-ops" => {
                    config.image_ops.clear();
                    ops_given = true;
                }
                "-o" | "--output" => config.output = PathBuf::from(value(flag, args.next())?),
                other => return Err(format!("unknown argument '{other}'")),
            }
        }
        Ok(config)
    }

    pub fn framebuffer_desc(&self) -> FrameBufferDesc {
        FrameBufferDesc::new(self.size, self.color_format, self.channels).with_render_task_size(self.render_task_size)
    }

    pub fn image_op_descs(&self) -> Result<Vec<ImageOpDesc>> {
        self.image_ops.iter().map(|name| ImageOpDesc::from_name(name)).collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.framebuffer_desc().validate()?;
        if self.adaptive.samples_per_pixel == 0 {
            return Err(FrameBufferError::InvalidSamplesPerPixel);
        }
        Ok(())
    }
}
