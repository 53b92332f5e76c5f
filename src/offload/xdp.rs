//! loads the XDP program, rewrites its link-time constants and attaches
//! it either directly to the interface or into a tail-call hook map

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use aya::maps::{Map, MapData, ProgramArray};
use aya::programs::{Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader};
use derive_more::{Display, Error, From};

use crate::config::OffloaderConfig;
use crate::offload::maps::{
    self, PassMap4, PassMap6, RuntimeConfigMap, RUNTIME_CONFIG_DRYRUN,
};

pub const DEFAULT_INTERFACE: &str = "lo";
pub const DEFAULT_BPF_PATH: &str = "/usr/lib/yadns-xdp.bpf.o";
pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/xdp/globals";
pub const DEFAULT_HOOK_PIN_PATH: &str = "/sys/fs/bpf/xdp/bpftail-call/xdpcap_hook";

pub const PROGRAM_NAME: &str = "xdp_dns";

/// link-time constants rewritten before the object is loaded
const FLAG_PREFIX: &str = "yadns_xdp_resp_flag_";
const CONST_RANDOM_TTL: &str = "yadns_xdp_resp_random_ttl";
const CONST_METRICS_ENABLED: &str = "yadns_xdp_bpf_metrics_enabled";
const CONST_XDPCAP_ENABLED: &str = "yadns_xdp_bpf_xdpcap_enabled";
const CONST_BPF_DRYRUN: &str = "yadns_xdp_bpf_dryrun";

#[derive(Debug, Display, From, Error)]
pub enum XdpError {
    Load(aya::EbpfError),
    Program(aya::programs::ProgramError),
    Map(crate::offload::maps::MapError),
    BpfMap(aya::maps::MapError),
    Io(std::io::Error),
    Nix(nix::Error),
    #[display(fmt = "{}", _0)]
    #[from(ignore)]
    Config(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, XdpError>;

/// Whether this process owns the interface attachment or rides along in
/// another program's tail-call hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMode {
    Primary,
    Secondary,
}

impl std::fmt::Display for LoaderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoaderMode::Primary => write!(f, "primary"),
            LoaderMode::Secondary => write!(f, "secondary"),
        }
    }
}

pub struct XdpService {
    ebpf: Ebpf,
    mode: LoaderMode,
    pin_path: PathBuf,
    options: OffloaderConfig,
    attached: bool,
}

/// Mount the BPF filesystem if nothing is mounted there yet.
fn mount_bpffs() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    match mount(
        Some("bpf"),
        "/sys/fs/bpf",
        Some("bpf"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        Ok(()) => {
            log::debug!("(xdp) mounted bpffs at /sys/fs/bpf");
            Ok(())
        }
        // already mounted
        Err(nix::errno::Errno::EBUSY) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn parse_cidr(text: &str) -> Result<(IpAddr, u32)> {
    let (addr, len) = match text.split_once('/') {
        Some((addr, len)) => {
            let len = len
                .parse::<u32>()
                .map_err(|_| XdpError::Config(format!("bad prefix length in '{}'", text)))?;
            (addr, len)
        }
        None => (text, u32::MAX),
    };

    let ip = addr
        .parse::<IpAddr>()
        .map_err(|_| XdpError::Config(format!("bad address in '{}'", text)))?;

    let max = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let len = if len == u32::MAX { max } else { len };
    if len > max {
        return Err(XdpError::Config(format!("prefix too long in '{}'", text)));
    }

    Ok((ip, len))
}

impl XdpService {
    /// Load the object file with constants rewritten from configuration.
    /// Failure here is fatal for the process; map pins created by the load
    /// survive for the data pipeline.
    pub fn load(options: &OffloaderConfig) -> Result<XdpService> {
        let id = "(xdp) (service)";

        let pin_path = PathBuf::from(if options.pin_path.is_empty() {
            DEFAULT_PIN_PATH
        } else {
            options.pin_path.as_str()
        });

        if options.mount_bpffs {
            mount_bpffs()?;
        }

        if options.raise_memlock {
            nix::sys::resource::setrlimit(
                nix::sys::resource::Resource::RLIMIT_MEMLOCK,
                nix::sys::resource::RLIM_INFINITY,
                nix::sys::resource::RLIM_INFINITY,
            )?;
        }

        std::fs::create_dir_all(&pin_path)?;

        let bpf_path = if options.path.is_empty() {
            DEFAULT_BPF_PATH
        } else {
            options.path.as_str()
        };

        let flag_aa = options.response_flags.iter().any(|f| f == "AA") as u8;
        let flag_rd = options.response_flags.iter().any(|f| f == "RD") as u8;
        let flag_mbz = options.response_flags.iter().any(|f| f == "MBZ") as u8;
        let random_ttl = options.response_random_ttl as u8;
        let metrics_enabled = options.bpf_metrics as u8;
        let xdpcap_enabled = options.bpf_xdpcap as u8;
        let dryrun = options.bpf_dryrun as u8;

        for (name, value) in [
            (format!("{}aa", FLAG_PREFIX), flag_aa),
            (format!("{}rd", FLAG_PREFIX), flag_rd),
            (format!("{}mbz", FLAG_PREFIX), flag_mbz),
            (CONST_RANDOM_TTL.to_string(), random_ttl),
            (CONST_METRICS_ENABLED.to_string(), metrics_enabled),
            (CONST_XDPCAP_ENABLED.to_string(), xdpcap_enabled),
            (CONST_BPF_DRYRUN.to_string(), dryrun),
        ] {
            log::debug!("{} setting BPF constant '{}' -> '{}'", id, name, value != 0);
        }

        let ebpf = EbpfLoader::new()
            .map_pin_path(&pin_path)
            .set_global(&format!("{}aa", FLAG_PREFIX), &flag_aa, true)
            .set_global(&format!("{}rd", FLAG_PREFIX), &flag_rd, true)
            .set_global(&format!("{}mbz", FLAG_PREFIX), &flag_mbz, true)
            .set_global(CONST_RANDOM_TTL, &random_ttl, true)
            .set_global(CONST_METRICS_ENABLED, &metrics_enabled, true)
            .set_global(CONST_XDPCAP_ENABLED, &xdpcap_enabled, true)
            .set_global(CONST_BPF_DRYRUN, &dryrun, true)
            .load_file(bpf_path)?;

        for required in [
            maps::MAP_RR_A,
            maps::MAP_RR_AAAA,
            maps::MAP_PASS4,
            maps::MAP_PASS6,
        ] {
            if ebpf.map(required).is_none() {
                return Err(XdpError::Config(format!(
                    "no bpf map '{}' in object '{}'",
                    required, bpf_path
                )));
            }
        }

        let mode = Self::resolve_mode(options)?;

        log::debug!(
            "{} bpf:'{}' loaded, mode:'{}' pinpath:'{}'",
            id,
            bpf_path,
            mode,
            pin_path.display()
        );

        let mut service = XdpService {
            ebpf,
            mode,
            pin_path,
            options: options.clone(),
            attached: false,
        };

        service.seed_pass_maps()?;
        service.set_dryrun(options.bpf_dryrun)?;

        Ok(service)
    }

    fn resolve_mode(options: &OffloaderConfig) -> Result<LoaderMode> {
        let hook_pin = if options.hook_pin_path.is_empty() {
            DEFAULT_HOOK_PIN_PATH
        } else {
            options.hook_pin_path.as_str()
        };

        let hook_present = Path::new(hook_pin).exists();

        match options.loader_mode.as_str() {
            "primary" => Ok(LoaderMode::Primary),
            "secondary" => {
                if !hook_present {
                    return Err(XdpError::Config(format!(
                        "secondary mode requested but hook pin '{}' is missing",
                        hook_pin
                    )));
                }
                Ok(LoaderMode::Secondary)
            }
            "auto" | "" => {
                if hook_present {
                    Ok(LoaderMode::Secondary)
                } else {
                    Ok(LoaderMode::Primary)
                }
            }
            other => Err(XdpError::Config(format!("unknown loader mode '{}'", other))),
        }
    }

    pub fn mode(&self) -> LoaderMode {
        self.mode
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn pin_path(&self) -> &Path {
        &self.pin_path
    }

    /// Attach the program: directly to the interface in primary mode, or
    /// by inserting our fd into the exported tail-call hook map at each
    /// configured index in secondary mode.
    pub fn attach(&mut self) -> Result<()> {
        let id = "(xdp) (attach)";

        let iface = if self.options.interface.is_empty() {
            DEFAULT_INTERFACE
        } else {
            self.options.interface.as_str()
        };

        let program: &mut Xdp = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| XdpError::Config(format!("program '{}' not found", PROGRAM_NAME)))?
            .try_into()?;
        program.load()?;

        match self.mode {
            LoaderMode::Primary => {
                program.attach(iface, XdpFlags::SKB_MODE)?;
                self.attached = true;
                log::debug!("{} attached to interface:'{}'", id, iface);
            }
            LoaderMode::Secondary => {
                let hook_pin = if self.options.hook_pin_path.is_empty() {
                    DEFAULT_HOOK_PIN_PATH
                } else {
                    self.options.hook_pin_path.as_str()
                };

                let data = MapData::from_pin(hook_pin)?;
                let mut hook = ProgramArray::try_from(Map::ProgramArray(data))?;

                let fd = program.fd()?;
                for index in &self.options.hook_index {
                    hook.set(*index, fd, 0)?;
                    log::debug!("{} attached into hook:'{}' index:'{}'", id, hook_pin, index);
                }
                self.attached = true;
            }
        }

        Ok(())
    }

    fn seed_pass_maps(&mut self) -> Result<()> {
        let id = "(xdp) (pass)";

        if !self.options.pass4.is_empty() {
            let mut pass4 = PassMap4::open_pinned(&self.pin_path)?;
            for cidr in &self.options.pass4 {
                match parse_cidr(cidr)? {
                    (IpAddr::V4(addr), len) => {
                        pass4.update(len, addr.octets(), 0)?;
                        log::debug!("{} map:'{}' add '{}'", id, maps::MAP_PASS4, cidr);
                    }
                    _ => {
                        return Err(XdpError::Config(format!(
                            "ipv6 prefix '{}' configured for {}",
                            cidr,
                            maps::MAP_PASS4
                        )))
                    }
                }
            }
        }

        if !self.options.pass6.is_empty() {
            let mut pass6 = PassMap6::open_pinned(&self.pin_path)?;
            for cidr in &self.options.pass6 {
                match parse_cidr(cidr)? {
                    (IpAddr::V6(addr), len) => {
                        pass6.update(len, addr.octets(), 0)?;
                        log::debug!("{} map:'{}' add '{}'", id, maps::MAP_PASS6, cidr);
                    }
                    _ => {
                        return Err(XdpError::Config(format!(
                            "ipv4 prefix '{}' configured for {}",
                            cidr,
                            maps::MAP_PASS6
                        )))
                    }
                }
            }
        }

        Ok(())
    }

    /// Flip the datapath into or out of dry-run via the runtime-config
    /// array; in dry-run every packet is passed up the stack.
    pub fn set_dryrun(&self, dryrun: bool) -> Result<()> {
        let mut config = RuntimeConfigMap::open_pinned(&self.pin_path)?;
        config.write_slot(RUNTIME_CONFIG_DRYRUN, dryrun as u32)?;
        log::debug!("(xdp) runtime-config dryrun set to '{}'", dryrun);
        Ok(())
    }

    pub fn runtime_config(&self) -> Result<Vec<u32>> {
        let config = RuntimeConfigMap::open_pinned(&self.pin_path)?;
        Ok(config.entries()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parsing() {
        assert_eq!(
            parse_cidr("10.0.0.0/8").unwrap(),
            ("10.0.0.0".parse().unwrap(), 8)
        );
        assert_eq!(
            parse_cidr("2a02:6b8::/32").unwrap(),
            ("2a02:6b8::".parse().unwrap(), 32)
        );
        // host routes default to the full prefix
        assert_eq!(
            parse_cidr("192.0.2.1").unwrap(),
            ("192.0.2.1".parse().unwrap(), 32)
        );
        assert!(parse_cidr("10.0.0.0/40").is_err());
        assert!(parse_cidr("not-an-ip/8").is_err());
    }
}
