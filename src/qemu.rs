//! Hypervisor command line assembly.
//!
//! The argument vector is a pure function of the VM configuration and its
//! path layout. Groups are concatenated in a fixed order: machine, primary
//! storage, seed disk, network cards, guest agent, peripherals/console tail.

use crate::paths::VmPaths;
use crate::vm::VmConfig;

/// Name of the virtio-serial port the guest agent opens.
pub const GUEST_AGENT_PORT: &str = "io.vemu.guest_agent.0";

pub fn hypervisor_args(config: &VmConfig, paths: &VmPaths) -> Vec<String> {
    let mut args = Vec::new();
    args.extend(machine_args(config));
    args.extend(storage_args(paths));
    args.extend(seed_disk_args(paths));
    for card in &config.network_cards {
        args.extend(card.hypervisor_args());
    }
    if config.guest_agent_enabled {
        args.extend(guest_agent_args(paths));
    }
    args.extend(tail_args(config, paths));
    args
}

fn machine_args(config: &VmConfig) -> Vec<String> {
    let cpus = config.cpu_count;
    let threads = config.threads_per_core;
    let mut args = vec![
        "-m".to_string(),
        config.memory_mb.to_string(),
        "-cpu".into(),
        "host".into(),
        "-machine".into(),
        "q35,accel=kvm".into(),
        "-smp".into(),
        format!("{cpus},sockets=1,cores={cpus},threads={threads}"),
    ];
    if !config.tools.firmware.is_empty() {
        args.push("-drive".into());
        args.push(format!(
            "if=pflash,format=raw,readonly=on,file={},",
            config.tools.firmware
        ));
    }
    args.push("-boot".into());
    args.push("order=c,splash-time=0,menu=on,".into());
    args
}

fn storage_args(paths: &VmPaths) -> Vec<String> {
    vec![
        "-drive".into(),
        format!(
            "file={},if=virtio,discard=on,cache=unsafe",
            paths.diffdisk().display()
        ),
    ]
}

fn seed_disk_args(paths: &VmPaths) -> Vec<String> {
    vec![
        "-drive".into(),
        format!(
            "id=cdrom0,if=none,format=raw,readonly=on,file={}",
            paths.seed_disk().display()
        ),
        "-device".into(),
        "virtio-scsi-pci,id=scsi0".into(),
        "-device".into(),
        "scsi-cd,bus=scsi0.0,drive=cdrom0".into(),
    ]
}

fn guest_agent_args(paths: &VmPaths) -> Vec<String> {
    vec![
        "-chardev".into(),
        format!(
            "socket,path={},server=on,wait=off,id=qga0",
            paths.guest_agent_socket().display()
        ),
        "-device".into(),
        "virtio-serial".into(),
        "-device".into(),
        format!("virtserialport,chardev=qga0,name={GUEST_AGENT_PORT}"),
    ]
}

fn tail_args(config: &VmConfig, paths: &VmPaths) -> Vec<String> {
    let mut args: Vec<String> = [
        "-device",
        "virtio-rng-pci",
        "-display",
        "none",
        "-device",
        "virtio-vga",
        "-device",
        "virtio-keyboard-pci",
        "-device",
        "virtio-mouse-pci",
        "-device",
        "qemu-xhci,id=usb-bus",
        "-parallel",
        "none",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    // serial.log
    args.push("-chardev".into());
    args.push(format!(
        "socket,id=char-serial,path={},server=on,wait=off,logfile={}",
        paths.serial_socket().display(),
        paths.serial_log().display()
    ));
    args.push("-serial".into());
    args.push("chardev:char-serial".into());

    // serialv.log
    args.push("-chardev".into());
    args.push(format!(
        "socket,id=char-serial-virtio,path={},server=on,wait=off,logfile={}",
        paths.serial_virtio_socket().display(),
        paths.serial_virtio_log().display()
    ));
    args.push("-device".into());
    args.push("virtio-serial-pci,id=virtio-serial0".into());
    args.push("-device".into());
    args.push("virtconsole,chardev=char-serial-virtio,id=console0".into());

    // QMP
    args.push("-chardev".into());
    args.push(format!(
        "socket,id=char-qmp,path={},server=on,wait=off",
        paths.qmp_socket().display()
    ));
    args.push("-qmp".into());
    args.push("chardev:char-qmp".into());

    args.push("-name".into());
    args.push(config.name.clone());
    args.push("-pidfile".into());
    args.push(paths.pid_file().display().to_string());
    args
}
