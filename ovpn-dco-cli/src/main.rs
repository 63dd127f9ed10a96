// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use clap::{Arg, Command};
use daemonize::{Daemonize, Outcome};
use ovpn_dco::config::ProvisioningConfig;
use ovpn_dco::device::drop_privileges::drop_privileges;
use ovpn_dco::device::{DeviceConfig, DeviceHandle, Mode};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::process::exit;
use tracing::Level;

fn main() {
    let matches = Command::new("ovpn-dco")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Vicente Aceituno Canal <vpn@cableguard.org>")
        .about("Userspace OpenVPN data channel offload")
        .args(&[
            Arg::new("INTERFACE_NAME")
                .required(true)
                .takes_value(true)
                .help("The name of the created interface"),
            Arg::new("foreground")
                .long("foreground")
                .short('f')
                .help("Run and log in the foreground"),
            Arg::new("mode")
                .takes_value(true)
                .long("mode")
                .short('m')
                .env("OVPN_DCO_MODE")
                .possible_values(["p2p", "mp"])
                .help("Point-to-point (one peer) or multi-peer")
                .default_value("p2p"),
            Arg::new("threads")
                .takes_value(true)
                .long("threads")
                .short('t')
                .env("OVPN_DCO_THREADS")
                .help("Number of UDP receive threads per address family")
                .default_value("4"),
            Arg::new("listen-port")
                .takes_value(true)
                .long("listen-port")
                .short('p')
                .env("OVPN_DCO_LISTEN_PORT")
                .help("UDP port to listen on, 0 for any")
                .default_value("1194"),
            Arg::new("verbosity")
                .takes_value(true)
                .long("verbosity")
                .short('v')
                .env("OVPN_DCO_LOG_LEVEL")
                .possible_values(["error", "info", "debug", "trace"])
                .help("Log verbosity")
                .default_value("error"),
            Arg::new("uapi-fd")
                .long("uapi-fd")
                .env("OVPN_DCO_UAPI_FD")
                .help("File descriptor for the control API")
                .default_value("-1"),
            Arg::new("tun-fd")
                .long("tun-fd")
                .env("OVPN_DCO_TUN_FD")
                .help("File descriptor for an already-existing TUN device")
                .default_value("-1"),
            Arg::new("config")
                .takes_value(true)
                .long("config")
                .short('c')
                .env("OVPN_DCO_CONFIG")
                .help("JSON file with peers, keys and routes to provision at start-up"),
            Arg::new("log")
                .takes_value(true)
                .long("log")
                .short('l')
                .env("OVPN_DCO_LOG_FILE")
                .help("Log file")
                .default_value("/tmp/ovpn-dco.out"),
            Arg::new("disable-ipv6")
                .long("disable-ipv6")
                .help("Do not listen on IPv6"),
            Arg::new("disable-drop-privileges")
                .long("disable-drop-privileges")
                .env("OVPN_DCO_SUDO")
                .help("Do not drop sudo privileges"),
        ])
        .get_matches();

    let background = !matches.is_present("foreground");
    let tun_name = matches.value_of("INTERFACE_NAME").unwrap_or_default();
    let mode: Mode = matches.value_of_t("mode").unwrap_or_else(|e| e.exit());
    let n_threads: usize = matches.value_of_t("threads").unwrap_or_else(|e| e.exit());
    let listen_port: u16 = matches.value_of_t("listen-port").unwrap_or_else(|e| e.exit());
    let log_level: Level = matches.value_of_t("verbosity").unwrap_or_else(|e| e.exit());
    let uapi_fd: i32 = matches.value_of_t("uapi-fd").unwrap_or_else(|e| e.exit());
    let tun_fd: i32 = matches.value_of_t("tun-fd").unwrap_or_else(|e| e.exit());

    // Read the provisioning file before forking so mistakes show up on the terminal
    let provisioning = match matches.value_of("config") {
        Some(path) => match ProvisioningConfig::load(Path::new(path)) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("Error: Failed to read {}: {}", path, e);
                exit(1);
            }
        },
        None => None,
    };

    // Create a socketpair to communicate between forked processes
    let (sock1, sock2) = UnixDatagram::pair().unwrap_or_else(|e| {
        eprintln!("Error: Failed to create socket pair: {}", e);
        exit(1);
    });
    let _ = sock1.set_nonblocking(true);

    let _guard;

    if background {
        let log = matches.value_of("log").unwrap_or("/tmp/ovpn-dco.out");

        // Append to an existing log file, create it otherwise
        let log_file = if let Ok(metadata) = std::fs::metadata(log) {
            if metadata.is_file() {
                OpenOptions::new().append(true).open(log)
            } else {
                Err(io::Error::new(
                    ErrorKind::Other,
                    format!("{} is not a regular file.", log),
                ))
            }
        } else {
            File::create(log)
        }
        .unwrap_or_else(|err| {
            eprintln!("Error: Failed to open log file {}: {}", log, err);
            exit(1);
        });

        let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
        _guard = guard;

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();

        let daemonize = Daemonize::new().working_directory("/tmp");
        match daemonize.execute() {
            Outcome::Parent(Ok(_)) => {
                // Wait for the child to report how start-up went
                let mut b = [0u8; 1];
                if sock2.recv(&mut b).is_ok() && b[0] == 1 {
                    println!("Info: ovpn-dco started successfully");
                    exit(0);
                } else {
                    println!("Error: ovpn-dco failed to start. Check if the capabilities are set and you are running with enough privileges.");
                    exit(1);
                }
            }
            Outcome::Parent(Err(_)) => {
                println!("Error: ovpn-dco failed to start. Check if the capabilities are set and you are running with enough privileges.");
                exit(1);
            }
            Outcome::Child(_) => {}
        }
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_max_level(log_level)
            .init();
    }

    let config = DeviceConfig {
        mode,
        n_threads,
        listen_port,
        use_ipv6: !matches.is_present("disable-ipv6"),
        tun_fd,
        uapi_fd,
    };

    let mut device_handle = match DeviceHandle::new(tun_name, &config) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(message = "Failed to initialize the device. Check if you are running with sudo", error = ?e);
            let _ = sock1.send(&[0]);
            exit(1);
        }
    };

    if let Some(provisioning) = provisioning {
        if let Err(e) = device_handle.apply_config(&provisioning) {
            tracing::error!(message = "Failed to apply the provisioning file", error = ?e);
            let _ = sock1.send(&[0]);
            exit(1);
        }
    }

    if !matches.is_present("disable-drop-privileges") {
        if let Err(e) = drop_privileges() {
            tracing::error!(message = "Failed to drop privileges", error = ?e);
            let _ = sock1.send(&[0]);
            exit(1);
        }
    }

    // Notify parent that start-up succeeded
    let _ = sock1.send(&[1]);
    drop(sock1);

    tracing::info!(message = "ovpn-dco running", interface = tun_name, %mode);

    device_handle.wait();
}
