//! 局域网地址探测，仅用于启动日志。

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// 探测本机的局域网 IPv4 地址，只接受私有网段。
///
/// UDP `connect` 只让系统选路，不发送任何数据包。
pub fn lan_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if is_lan_candidate(*addr.ip()) => Some(*addr.ip()),
        _ => None,
    }
}

/// 10/8、172.16/12、192.168/16。
fn is_lan_candidate(ip: Ipv4Addr) -> bool {
    ip.is_private()
}

/// 监听地址为通配地址时换成局域网地址，便于展示可访问的 URL。
pub fn display_host(bind: IpAddr) -> IpAddr {
    if bind.is_unspecified() {
        lan_ipv4().map(IpAddr::V4).unwrap_or(bind)
    } else {
        bind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_private_ranges_are_lan_addresses() {
        assert!(!is_lan_candidate(Ipv4Addr::LOCALHOST));
        assert!(!is_lan_candidate(Ipv4Addr::UNSPECIFIED));
        assert!(!is_lan_candidate(Ipv4Addr::new(169, 254, 3, 4)));
        assert!(!is_lan_candidate(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_lan_candidate(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(is_lan_candidate(Ipv4Addr::new(192, 168, 0, 103)));
        assert!(is_lan_candidate(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(is_lan_candidate(Ipv4Addr::new(172, 20, 1, 1)));
    }

    #[test]
    fn explicit_bind_address_is_shown_as_is() {
        let bind: IpAddr = "127.0.0.1".parse().expect("ip");
        assert_eq!(display_host(bind), bind);
    }
}
