//! Emulator argument list.

use std::net::SocketAddrV4;

use crate::runtime::constants::emulator;
use crate::runtime::options::MachineConfig;
use crate::vmm::host_check::Acceleration;

/// Build the `qemu-system-*` argument list for `config`.
///
/// The disk is opened in snapshot mode so the guest never writes back, there
/// is no graphical console, and host `forward` is mapped to guest port 22.
/// Every value-taking flag is immediately followed by its value.
pub fn build_args(
    config: &MachineConfig,
    forward: SocketAddrV4,
    acceleration: Acceleration,
) -> Vec<String> {
    let hostfwd = format!("hostfwd=tcp:{}-:{}", forward, emulator::GUEST_SSH_PORT);

    let mut args: Vec<String> = vec![
        "-snapshot".into(),
        "-nographic".into(),
        "-hda".into(),
        config.disk_path.display().to_string(),
        "-kernel".into(),
        config.image.kernel_path.display().to_string(),
        "-append".into(),
        emulator::KERNEL_APPEND.into(),
        "-smp".into(),
        config.cpus.to_string(),
        "-m".into(),
        config.memory_mib.to_string(),
        "-device".into(),
        emulator::NET_DEVICE.into(),
        "-netdev".into(),
        format!("user,id={},{}", emulator::NETDEV_ID, hostfwd),
    ];

    if let Some(endpoint) = &config.debug {
        args.extend(["-gdb".to_string(), endpoint.clone()]);
    }

    if let Some(initrd) = &config.image.initrd_path {
        args.extend(["-initrd".to_string(), initrd.display().to_string()]);
    }

    match acceleration {
        Acceleration::Kvm => args.push("-enable-kvm".into()),
        Acceleration::Hvf => args.extend(["-accel", "hvf", "-cpu", "host"].map(String::from)),
        Acceleration::None => {}
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::options::{Arch, MachineImage};
    use std::net::Ipv4Addr;

    fn config() -> MachineConfig {
        MachineConfig::new(
            Arch::X86_64,
            MachineImage::new("bzImage", "/boot/bzImage"),
            "/images/disk.img",
        )
    }

    fn forward() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 3, 4, 5), 23456)
    }

    /// Value following `flag`, if present.
    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_base_invocation() {
        let args = build_args(&config(), forward(), Acceleration::None);

        assert!(args.contains(&"-snapshot".to_string()));
        assert!(args.contains(&"-nographic".to_string()));
        assert_eq!(value_of(&args, "-hda"), Some("/images/disk.img"));
        assert_eq!(value_of(&args, "-kernel"), Some("/boot/bzImage"));
        assert_eq!(
            value_of(&args, "-append"),
            Some("root=/dev/sda ignore_loglevel console=ttyS0 rw")
        );
        assert_eq!(value_of(&args, "-smp"), Some("1"));
        assert_eq!(value_of(&args, "-m"), Some("512"));
        assert_eq!(value_of(&args, "-device"), Some("e1000,netdev=n1"));
        assert_eq!(
            value_of(&args, "-netdev"),
            Some("user,id=n1,hostfwd=tcp:127.3.4.5:23456-:22")
        );
    }

    #[test]
    fn test_optional_flags_absent_by_default() {
        let args = build_args(&config(), forward(), Acceleration::None);
        for flag in ["-gdb", "-initrd", "-enable-kvm", "-accel", "-cpu"] {
            assert!(!args.iter().any(|a| a == flag), "unexpected {}", flag);
        }
    }

    #[test]
    fn test_resources_from_config() {
        let args = build_args(
            &config().cpus(4).memory_mib(2048),
            forward(),
            Acceleration::None,
        );
        assert_eq!(value_of(&args, "-smp"), Some("4"));
        assert_eq!(value_of(&args, "-m"), Some("2048"));
    }

    #[test]
    fn test_debug_and_initrd() {
        let mut config = config().debug("tcp::1234");
        config.image = config.image.clone().with_initrd("/boot/initrd.img");

        let args = build_args(&config, forward(), Acceleration::None);
        assert_eq!(value_of(&args, "-gdb"), Some("tcp::1234"));
        assert_eq!(value_of(&args, "-initrd"), Some("/boot/initrd.img"));
    }

    #[test]
    fn test_kvm_flag() {
        let args = build_args(&config(), forward(), Acceleration::Kvm);
        assert!(args.contains(&"-enable-kvm".to_string()));
        assert!(!args.contains(&"-accel".to_string()));
    }

    #[test]
    fn test_hvf_flags() {
        let args = build_args(&config(), forward(), Acceleration::Hvf);
        assert_eq!(value_of(&args, "-accel"), Some("hvf"));
        assert_eq!(value_of(&args, "-cpu"), Some("host"));
        assert!(!args.contains(&"-enable-kvm".to_string()));
    }
}
