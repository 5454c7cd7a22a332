//! Launch specification for the virtualization engine.
//!
//! [`build`] turns a [`VmConfig`] plus a [`LaunchMode`] into the ordered
//! argument list handed to `qemu-system-<arch>`. Arguments are positional
//! flag/value pairs; the order below is part of the contract.
//!
//! ```text
//! machine profile (per arch) ─► shared devices ─► firmware vars ─► monitor
//!   ─► boot disk (virtio | nvme) ─► cd images ─► display
//! ```

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::config::{Architecture, VmConfig};
use crate::error::LaunchError;
use crate::settings::{RDP_HOST_PORT, SSH_HOST_PORT};

/// Monitor chardev id shared by `-chardev` and `-mon`.
const MONITOR_CHARDEV: &str = "mon0";

/// How the VM is presented on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// Graphical display window.
    #[default]
    Normal,
    /// No display; the serial console goes to the controlling terminal.
    Headless,
}

/// Image files that were found on disk at launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImages {
    pub main: PathBuf,
    pub cd: Option<PathBuf>,
    pub cd2: Option<PathBuf>,
}

/// Everything needed to spawn one engine process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub args: Vec<String>,
    pub images: ResolvedImages,
    pub monitor_port: u16,
    pub mode: LaunchMode,
}

/// Machine model, accelerator and NIC model for one architecture.
struct MachineProfile {
    machine: &'static str,
    accel: &'static str,
    nic: &'static str,
}

fn profile_for(arch: &Architecture) -> Result<MachineProfile, LaunchError> {
    match arch {
        Architecture::Aarch64 => Ok(MachineProfile {
            machine: "virt,highmem=no",
            accel: "hvf",
            nic: "user,model=virtio",
        }),
        Architecture::X86_64 => Ok(MachineProfile {
            machine: "pc",
            accel: "tcg,tb-size=32",
            nic: "user",
        }),
        Architecture::Other(name) => Err(LaunchError::UnsupportedArchitecture(name.clone())),
    }
}

/// Pick a control port for this launch. Nothing checks that the port is free; a clash only
/// shows up later when the monitor connection fails.
pub fn pick_monitor_port(range: RangeInclusive<u16>) -> u16 {
    rand::rng().random_range(range)
}

/// Resolve images against the filesystem.
///
/// The main image is required. A CD image is only used when its mount flag is
/// set and the file exists; otherwise it is silently left out.
pub fn resolve_images(config: &VmConfig) -> Result<ResolvedImages, LaunchError> {
    if !config.main_image.is_file() {
        return Err(LaunchError::MissingMainImage(config.main_image.clone()));
    }
    let optional = |mount: bool, path: &Path| (mount && path.is_file()).then(|| path.to_path_buf());

    Ok(ResolvedImages {
        main: config.main_image.clone(),
        cd: optional(config.mount_cd_image, &config.cd_image),
        cd2: optional(config.mount_cd_image2, &config.cd_image2),
    })
}

/// Network device options: extra user options, then SSH, then RDP forwards.
pub fn nic_options(config: &VmConfig) -> String {
    let mut options = String::new();
    if !config.nic_extra_options.is_empty() {
        options.push(',');
        options.push_str(&config.nic_extra_options);
    }
    if config.ssh_port_forward {
        options.push_str(&format!(",hostfwd=tcp::{SSH_HOST_PORT}-:22"));
    }
    if config.rdp_port_forward {
        options.push_str(&format!(",hostfwd=tcp::{RDP_HOST_PORT}-:3389"));
    }
    options
}

/// Build a launch spec with a freshly drawn control port.
pub fn build(
    config: &VmConfig,
    mode: LaunchMode,
    firmware: &Path,
    ports: RangeInclusive<u16>,
) -> Result<LaunchSpec, LaunchError> {
    build_with_port(config, mode, firmware, pick_monitor_port(ports))
}

/// Build a launch spec bound to a known control port.
pub fn build_with_port(
    config: &VmConfig,
    mode: LaunchMode,
    firmware: &Path,
    monitor_port: u16,
) -> Result<LaunchSpec, LaunchError> {
    let images = resolve_images(config)?;
    let profile = profile_for(&config.architecture)?;

    if !firmware.is_file() {
        return Err(LaunchError::MissingFirmware(firmware.to_path_buf()));
    }
    if !config.nvram.is_file() {
        return Err(LaunchError::MissingNvram(config.nvram.clone()));
    }

    let smp = format!(
        "cpus={cores},sockets=1,cores={cores},threads=1",
        cores = config.cores
    );

    let mut args: Vec<String> = Vec::with_capacity(64);
    let mut pair = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    pair("-M", profile.machine.to_string());
    pair("-accel", profile.accel.to_string());
    pair("-cpu", "host".to_string());
    pair("-name", config.name.clone());
    pair("-smp", smp);
    pair("-m", format!("{}M", config.ram_megabytes));
    pair("-bios", firmware.display().to_string());
    pair("-device", config.graphics_device.clone());
    pair("-device", "qemu-xhci,id=xhci".to_string());
    pair("-device", "usb-kbd".to_string());
    pair("-device", "usb-tablet".to_string());
    pair("-device", "virtio-rng-pci".to_string());
    pair("-nic", format!("{}{}", profile.nic, nic_options(config)));
    pair("-rtc", "base=localtime,clock=host".to_string());
    pair(
        "-drive",
        format!("file={},format=raw,if=pflash,index=1", config.nvram.display()),
    );
    pair("-device", "intel-hda".to_string());
    pair("-device", "hda-duplex".to_string());
    pair(
        "-chardev",
        format!("socket,id={MONITOR_CHARDEV},host=localhost,port={monitor_port},server,nowait"),
    );
    pair(
        "-mon",
        format!("chardev={MONITOR_CHARDEV},mode=control,pretty=on"),
    );

    let cache = if config.use_write_through_cache {
        "writethrough"
    } else {
        "directsync"
    };
    if config.use_virtio {
        pair(
            "-drive",
            format!("file={},if=virtio,id=boot,cache={cache}", images.main.display()),
        );
    } else {
        pair(
            "-drive",
            format!("file={},if=none,id=boot,cache={cache}", images.main.display()),
        );
        pair("-device", "nvme,drive=boot,serial=boot".to_string());
    }

    for (path, id) in [(&images.cd, "cdimage"), (&images.cd2, "cdimage2")] {
        if let Some(path) = path {
            pair(
                "-drive",
                format!("file={},media=cdrom,if=none,id={id}", path.display()),
            );
            pair("-device", format!("usb-storage,drive={id}"));
        }
    }

    match mode {
        LaunchMode::Headless => {
            pair("-display", "none".to_string());
            pair("-serial", "stdio".to_string());
        }
        LaunchMode::Normal if config.unhide_mouse_pointer => {
            pair("-display", "cocoa,show-cursor=on".to_string());
        }
        LaunchMode::Normal => {}
    }

    Ok(LaunchSpec {
        args,
        images,
        monitor_port,
        mode,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
