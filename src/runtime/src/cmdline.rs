//! Guest kernel command line construction.
//!
//! The guest mounts its root filesystem over NFS and learns its network
//! identity from the command line, so the token set and ordering are part of
//! the guest contract and must stay byte-stable.

use std::net::Ipv4Addr;

use sandcastle_core::config::NfsSource;

/// Build the kernel command line for one VM.
///
/// `callback_url` is appended only when the caller supplied a direct HTTP
/// callback destination; without it the guest routes callbacks through the
/// datagram bridge.
pub fn kernel_cmdline(
    nfs: &NfsSource,
    gateway_ip: Ipv4Addr,
    guest_ip: Ipv4Addr,
    vm_name: &str,
    callback_url: Option<&str>,
) -> String {
    let mut cmdline = format!(
        "console=ttyS0 root=/dev/nfs nfsroot={}:{},nfsvers=3,tcp,nolock,port={} ip=dhcp rw \
         gateway_ip=\"{}\" guest_ip=\"{}\" vm_name=\"{}\"",
        nfs.server, nfs.path, nfs.port, gateway_ip, guest_ip, vm_name
    );

    if let Some(url) = callback_url {
        cmdline.push_str(&format!(" callback_url=\"{}\"", url));
    }

    cmdline
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nfs() -> NfsSource {
        NfsSource {
            server: "127.0.0.1".to_string(),
            port: 11111,
            path: "/exports/rootfs".to_string(),
        }
    }

    #[test]
    fn test_cmdline_exact_bytes() {
        let cmdline = kernel_cmdline(
            &nfs(),
            Ipv4Addr::new(10, 20, 1, 1),
            Ipv4Addr::new(10, 20, 1, 2),
            "alpha",
            None,
        );
        assert_eq!(
            cmdline,
            "console=ttyS0 root=/dev/nfs \
             nfsroot=127.0.0.1:/exports/rootfs,nfsvers=3,tcp,nolock,port=11111 ip=dhcp rw \
             gateway_ip=\"10.20.1.1\" guest_ip=\"10.20.1.2\" vm_name=\"alpha\""
        );
    }

    #[test]
    fn test_cmdline_with_callback_url() {
        let cmdline = kernel_cmdline(
            &nfs(),
            Ipv4Addr::new(10, 20, 1, 1),
            Ipv4Addr::new(10, 20, 1, 5),
            "beta",
            Some("https://callbacks.example.com/hook"),
        );
        assert!(cmdline.ends_with(" callback_url=\"https://callbacks.example.com/hook\""));
        assert!(cmdline.contains("root=/dev/nfs"));
    }

    #[test]
    fn test_cmdline_is_deterministic() {
        let a = kernel_cmdline(
            &nfs(),
            Ipv4Addr::new(10, 20, 1, 1),
            Ipv4Addr::new(10, 20, 1, 2),
            "alpha",
            None,
        );
        let b = kernel_cmdline(
            &nfs(),
            Ipv4Addr::new(10, 20, 1, 1),
            Ipv4Addr::new(10, 20, 1, 2),
            "alpha",
            None,
        );
        assert_eq!(a, b);
    }
}
