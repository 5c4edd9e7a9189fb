//! Integration tests for configuration validation (nothing may be spawned).

use qemuvisor::errors::{ConfigError, QemuError};
use qemuvisor::{Arch, MachineConfig, MachineImage, Supervisor};
use qemuvisor_test_utils::{FakeEmulator, Scenario};

#[test]
fn valid_config_is_accepted() {
    let fake = FakeEmulator::new(Scenario::Responsive);
    let machine = Supervisor::new(fake.config()).unwrap();

    assert_eq!(machine.config().cpus, 1);
    assert_eq!(machine.config().memory_mib, 512);
    assert!(machine.pid().is_none());
    assert!(fake.recorded_args().is_none());
}

#[test]
fn missing_kernel_is_rejected_before_spawn() {
    let fake = FakeEmulator::new(Scenario::Responsive);
    let kernel = fake.path().join("missing-bzImage");
    let config = MachineConfig::new(Arch::X86_64, MachineImage::new("gone", &kernel), &fake.disk)
        .emulator(&fake.emulator);

    match Supervisor::new(config) {
        Err(QemuError::Config(ConfigError::KernelNotFound { path, .. })) => {
            assert_eq!(path, kernel)
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("missing kernel accepted"),
    }
    assert!(fake.recorded_args().is_none());
}

#[test]
fn missing_disk_is_rejected_before_spawn() {
    let fake = FakeEmulator::new(Scenario::Responsive);
    let disk = fake.path().join("missing.img");
    let config = MachineConfig::new(
        Arch::X86_64,
        MachineImage::new("bzImage", &fake.kernel),
        &disk,
    )
    .emulator(&fake.emulator);

    match Supervisor::new(config) {
        Err(QemuError::Config(ConfigError::DiskNotFound { path, .. })) => assert_eq!(path, disk),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("missing disk accepted"),
    }
    assert!(fake.recorded_args().is_none());
}

#[test]
fn kernel_and_disk_errors_are_distinguishable() {
    let fake = FakeEmulator::new(Scenario::Responsive);
    let kernel_err = Supervisor::new(
        MachineConfig::new(
            Arch::X86_64,
            MachineImage::new("k", fake.path().join("nope")),
            &fake.disk,
        )
        .emulator(&fake.emulator),
    )
    .err()
    .unwrap();
    let disk_err = Supervisor::new(
        MachineConfig::new(
            Arch::X86_64,
            MachineImage::new("k", &fake.kernel),
            fake.path().join("nope"),
        )
        .emulator(&fake.emulator),
    )
    .err()
    .unwrap();

    assert!(kernel_err.to_string().contains("kernel image"));
    assert!(disk_err.to_string().contains("disk image"));
    assert!(kernel_err.is_pre_launch());
    assert!(disk_err.is_pre_launch());
}

#[test]
fn missing_initrd_is_rejected() {
    let fake = FakeEmulator::new(Scenario::Responsive);
    let image = MachineImage::new("bzImage", &fake.kernel).with_initrd(fake.path().join("initrd"));
    let config = MachineConfig::new(Arch::X86_64, image, &fake.disk).emulator(&fake.emulator);

    assert!(matches!(
        Supervisor::new(config),
        Err(QemuError::Config(ConfigError::InitrdNotFound { .. }))
    ));
}

#[test]
fn missing_emulator_override_is_rejected() {
    let fake = FakeEmulator::new(Scenario::Responsive);
    let config = fake.config().emulator(fake.path().join("qemu-system-none"));

    assert!(matches!(
        Supervisor::new(config),
        Err(QemuError::Config(ConfigError::BinaryNotFound { .. }))
    ));
}

#[test]
fn zero_resources_are_rejected() {
    let fake = FakeEmulator::new(Scenario::Responsive);

    assert!(matches!(
        Supervisor::new(fake.config().cpus(0)),
        Err(QemuError::Config(ConfigError::InvalidResources(_)))
    ));
    assert!(matches!(
        Supervisor::new(fake.config().memory_mib(0)),
        Err(QemuError::Config(ConfigError::InvalidResources(_)))
    ));
}

#[test]
fn unknown_architecture_is_rejected() {
    assert!(matches!(
        "sparc64".parse::<Arch>(),
        Err(ConfigError::UnsupportedArch(tag)) if tag == "sparc64"
    ));
}

#[test]
fn config_from_json_uses_defaults() {
    let fake = FakeEmulator::new(Scenario::Responsive);
    let json = serde_json::json!({
        "arch": "x86_64",
        "image": { "name": "bzImage", "kernel_path": fake.kernel },
        "disk_path": fake.disk,
        "emulator": fake.emulator,
    });
    let config: MachineConfig = serde_json::from_value(json).unwrap();

    assert_eq!(config.cpus, 1);
    assert_eq!(config.memory_mib, 512);
    assert!(config.timeout.is_none());
    assert!(Supervisor::new(config).is_ok());
}
