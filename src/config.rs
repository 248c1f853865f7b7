//! Configuration system for xdix
//!
//! Loads configuration from TOML file at `~/.config/xdix/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xdix_proto::{ImageFormat, SurfaceInfo};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub screens: Vec<ScreenConfig>,
    pub dri2: Dri2Config,
    pub xvmc: XvmcConfig,
    pub dri: DriConfig,
    pub composite: CompositeConfig,
}

impl Config {
    /// Load configuration from `path` (or the default location)
    ///
    /// A missing file at the default location is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            if path.is_some() {
                bail!("Config file {:?} does not exist", config_path);
            }
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default_with_screen());
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.screens.is_empty() {
            bail!("At least one [[screens]] entry is required");
        }
        if self.screens.iter().any(|s| s.width == 0 || s.height == 0) {
            bail!("Screen dimensions must be non-zero");
        }
        if !(1..=255).contains(&self.server.max_clients) {
            bail!("server.max_clients must be between 1 and 255");
        }
        if self.server.max_backlog == 0 {
            bail!("server.max_backlog must be at least 1");
        }
        if self.dri2.swap_limit == 0 {
            bail!("dri2.swap_limit must be at least 1");
        }
        for adaptor in &self.xvmc.adaptors {
            if adaptor.screen >= self.screens.len() {
                bail!("XvMC adaptor {:?} names missing screen {}", adaptor.name, adaptor.screen);
            }
        }
        Ok(())
    }

    /// Defaults plus the single screen a serialized default would carry
    pub fn default_with_screen() -> Self {
        Self {
            screens: vec![ScreenConfig::default()],
            ..Self::default()
        }
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("xdix");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default_with_screen())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Listener and client limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unix socket for local clients (default: `$XDG_RUNTIME_DIR/xdix.sock`)
    pub socket_path: Option<PathBuf>,
    /// TCP address for remote clients, e.g. "127.0.0.1:6000"
    pub tcp_listen: Option<String>,
    /// Maximum simultaneous clients (1-255)
    pub max_clients: usize,
    /// Expose all screens as one logical screen
    pub xinerama: bool,
    /// Requests a suspended client may queue before it is disconnected
    pub max_backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            tcp_listen: None,
            max_clients: 255,
            xinerama: false,
            max_backlog: 256,
        }
    }
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(xdix_proto::socket_path)
    }
}

/// Screen geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenConfig {
    pub width: u16,
    pub height: u16,
    /// Vertical refresh rate driving the MSC counter
    pub refresh_hz: u32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh_hz: 60,
        }
    }
}

/// DRI2 buffer and swap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dri2Config {
    pub enabled: bool,
    /// Driver name returned by Connect for DRI clients
    pub driver_name: String,
    /// Driver name returned by Connect for VDPAU clients
    pub vdpau_driver_name: Option<String>,
    /// Device node returned by Connect
    pub device_name: String,
    /// Swaps a drawable may have outstanding before new swaps are no-ops
    pub swap_limit: u32,
}

impl Default for Dri2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            driver_name: "swrast".to_string(),
            vdpau_driver_name: None,
            device_name: "/dev/dri/card0".to_string(),
            swap_limit: 1,
        }
    }
}

/// XvMC adaptors and client driver information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XvmcConfig {
    pub enabled: bool,
    /// Client-side driver library name reported by GetDRInfo
    pub client_driver_name: String,
    pub bus_id: String,
    pub driver_major: u32,
    pub driver_minor: u32,
    pub driver_patch_level: u32,
    pub adaptors: Vec<AdaptorConfig>,
}

impl Default for XvmcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_driver_name: "XvMCsoft".to_string(),
            bus_id: "PCI:0:2:0".to_string(),
            driver_major: 1,
            driver_minor: 0,
            driver_patch_level: 0,
            adaptors: vec![AdaptorConfig::default()],
        }
    }
}

/// One XvMC-capable Xv port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptorConfig {
    pub name: String,
    pub screen: usize,
    pub surfaces: Vec<SurfaceTypeConfig>,
    /// Image formats usable as subpictures
    pub formats: Vec<ImageFormat>,
}

/// IA44 and AI44 indexed subpicture formats
pub const FOURCC_IA44: u32 = 0x3434_4149;
pub const FOURCC_AI44: u32 = 0x3434_4941;

impl Default for AdaptorConfig {
    fn default() -> Self {
        let indexed = |id: u32| ImageFormat {
            id,
            kind: "yuv".to_string(),
            bits_per_pixel: 8,
            num_planes: 1,
            depth: 8,
            red_mask: 0,
            green_mask: 0,
            blue_mask: 0,
            packed: true,
            palette_entries: 16,
            component_order: "YUV".to_string(),
        };
        Self {
            name: "Software MPEG-2".to_string(),
            screen: 0,
            surfaces: vec![SurfaceTypeConfig::default()],
            formats: vec![indexed(FOURCC_IA44), indexed(FOURCC_AI44)],
        }
    }
}

/// Surface type an adaptor can decode into
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceTypeConfig {
    pub surface_type_id: u32,
    /// 1 = 4:2:0, 2 = 4:2:2, 3 = 4:4:4
    pub chroma_format: u16,
    pub max_width: u16,
    pub max_height: u16,
    pub subpicture_max_width: u16,
    pub subpicture_max_height: u16,
    pub mc_type: u32,
    pub flags: u32,
    /// Image format ids compatible as subpictures
    pub compatible_subpictures: Vec<u32>,
}

impl SurfaceTypeConfig {
    pub fn info(&self) -> SurfaceInfo {
        SurfaceInfo {
            surface_type_id: self.surface_type_id,
            chroma_format: self.chroma_format,
            max_width: self.max_width,
            max_height: self.max_height,
            subpicture_max_width: self.subpicture_max_width,
            subpicture_max_height: self.subpicture_max_height,
            mc_type: self.mc_type,
            flags: self.flags,
        }
    }
}

impl Default for SurfaceTypeConfig {
    fn default() -> Self {
        Self {
            // FOURCC "YV12"
            surface_type_id: 0x3231_5659,
            chroma_format: 1,
            max_width: 720,
            max_height: 576,
            subpicture_max_width: 720,
            subpicture_max_height: 576,
            // MPEG-2, motion compensation only
            mc_type: 0x0000_0002,
            flags: 0,
            compatible_subpictures: vec![FOURCC_IA44, FOURCC_AI44],
        }
    }
}

/// Legacy XF86DRI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriConfig {
    pub enabled: bool,
    pub client_driver_name: String,
    pub driver_major: u32,
    pub driver_minor: u32,
    pub driver_patch: u32,
    pub bus_id: String,
    /// Shared area handle returned by OpenConnection
    pub sarea_handle: u64,
    pub framebuffer_handle: u64,
    pub framebuffer_origin: u32,
    pub framebuffer_size: u32,
    pub framebuffer_stride: u32,
}

impl Default for DriConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_driver_name: "swrast".to_string(),
            driver_major: 4,
            driver_minor: 0,
            driver_patch: 0,
            bus_id: "PCI:0:2:0".to_string(),
            sarea_handle: 0xe000_0000,
            framebuffer_handle: 0xd000_0000,
            framebuffer_origin: 0,
            framebuffer_size: 1920 * 1080 * 4,
            framebuffer_stride: 1920 * 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeConfig {
    pub enabled: bool,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default_with_screen()).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.screens.len(), 1);
        assert_eq!(parsed.dri2.swap_limit, 1);
        assert_eq!(parsed.xvmc.adaptors[0].formats.len(), 2);
    }

    #[test]
    fn test_rejects_missing_screens_and_zero_swap_limit() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.screens.push(ScreenConfig::default());
        config.dri2.swap_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adaptor_screen_must_exist() {
        let mut config = Config::default_with_screen();
        config.xvmc.adaptors[0].screen = 3;
        assert!(config.validate().is_err());
    }
}
