//! Daemon configuration and command line.

use std::fmt;
use std::str::FromStr;

use clap::Parser;

pub const DEFAULT_ENDPOINT: &str = "/tmp/gmux_endpoint";

/// PCI bus/device/function of the mediated GPU, given as a 16-bit hex
/// triple (bus 8 / dev 5 / func 3), e.g. `0x0100` for 01:00.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bdf {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl FromStr for Bdf {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let value = u16::from_str_radix(raw, 16).map_err(|e| e.to_string())?;
        if value == 0 {
            return Err("BDF must be non-zero".into());
        }
        Ok(Bdf {
            bus: (value >> 8) as u8,
            dev: ((value >> 3) & 0x1f) as u8,
            func: (value & 0x7) as u8,
        })
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:01x}", self.bus, self.dev, self.func)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulerKind {
    Fifo,
    Credit,
    Band,
}

/// gmux — GPU mediation daemon
#[derive(Debug, Clone, Parser)]
#[command(name = "gmuxd", version, about)]
pub struct Config {
    /// PCI BDF of the GPU (hex, bus<<8 | dev<<3 | func)
    pub bdf: Bdf,

    /// Bypass mediation and pass every access straight through
    #[arg(long)]
    pub through: bool,

    /// Defer shadow page-table rebuilds until right before a fire
    #[arg(long = "lazy-shadowing")]
    pub lazy_shadowing: bool,

    /// Remap guest BAR3 pages onto the host aperture via the hypervisor
    #[arg(long = "bar3-remapping")]
    pub bar3_remapping: bool,

    /// GPU-time scheduler
    #[arg(long, value_enum, default_value = "band")]
    pub scheduler: SchedulerKind,

    /// Unix socket endpoint for guest sessions
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Log at debug level (twice for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bdf: Bdf {
                bus: 1,
                dev: 0,
                func: 0,
            },
            through: false,
            lazy_shadowing: false,
            bar3_remapping: false,
            scheduler: SchedulerKind::Band,
            endpoint: DEFAULT_ENDPOINT.into(),
            verbose: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bdf_parse() {
        let bdf: Bdf = "0x0100".parse().unwrap();
        assert_eq!(
            bdf,
            Bdf {
                bus: 1,
                dev: 0,
                func: 0
            }
        );
        let bdf: Bdf = "021f".parse().unwrap();
        assert_eq!(bdf.bus, 2);
        assert_eq!(bdf.dev, 3);
        assert_eq!(bdf.func, 7);
    }

    #[test]
    fn test_bdf_rejects_zero_and_garbage() {
        assert!("0".parse::<Bdf>().is_err());
        assert!("zz".parse::<Bdf>().is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cfg = Config::parse_from([
            "gmuxd",
            "0x0100",
            "--through",
            "--lazy-shadowing",
            "--scheduler",
            "credit",
        ]);
        assert!(cfg.through);
        assert!(cfg.lazy_shadowing);
        assert!(!cfg.bar3_remapping);
        assert_eq!(cfg.scheduler, SchedulerKind::Credit);
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
    }
}
