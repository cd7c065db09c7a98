// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use clap::Parser;
use ember_render_vk::VsyncMode;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file to read
    #[arg(long, default_value = "ember.toml")]
    pub config: PathBuf,
    /// Overrides `[render] clear_color`, as `r,g,b` or `r,g,b,a`
    #[arg(long, value_parser = parse_clear_color)]
    pub clear_color: Option<[f32; 4]>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub vsync_mode: VsyncModeCfg,
    pub unfocused: UnfocusedPolicy,
    pub unfocused_fps: u32,
    pub fps_when_vsync_off: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncModeCfg {
    Fifo,
    #[default]
    Mailbox,
}

impl From<VsyncModeCfg> for VsyncMode {
    fn from(mode: VsyncModeCfg) -> Self {
        match mode {
            VsyncModeCfg::Fifo => VsyncMode::Fifo,
            VsyncModeCfg::Mailbox => VsyncMode::Mailbox,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnfocusedPolicy {
    None,
    VsyncOn,
    #[default]
    Throttle,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppCfg {
    pub render: RenderCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: true,
            vsync_mode: VsyncModeCfg::Mailbox,
            unfocused: UnfocusedPolicy::Throttle,
            unfocused_fps: 30,
            fps_when_vsync_off: 0,
        }
    }
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Missing or malformed files fall back to defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).unwrap_or_else(|e| {
                warn!("{}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} not found; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("{}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn apply(&mut self, args: &Args) {
        if let Some(rgba) = args.clear_color {
            self.render.clear_color = rgba;
        }
    }
}

pub fn parse_clear_color(s: &str) -> Result<[f32; 4], String> {
    let parts = s
        .split(',')
        .map(|p| {
            let v: f32 = p
                .trim()
                .parse()
                .map_err(|e| format!("bad component {p:?}: {e}"))?;
            if (0.0..=1.0).contains(&v) {
                Ok(v)
            } else {
                Err(format!("component {v} outside 0..=1"))
            }
        })
        .collect::<Result<Vec<f32>, String>>()?;
    match parts[..] {
        [r, g, b] => Ok([r, g, b, 1.0]),
        [r, g, b, a] => Ok([r, g, b, a]),
        _ => Err(format!("expected 3 or 4 components, got {}", parts.len())),
    }
}
