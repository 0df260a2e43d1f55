/*!
peer.rs - The synthetic network peer the emulated NIC talks to
(`spec.md` §4.7), grounded on `original_source/net.c`. Two fixed MAC/IPv4
addresses stand in for "the rest of the network": `10.0.0.1` (the peer
itself) and `10.0.0.2` (the emulated machine). The peer answers ARP,
ICMP echo, DHCP, and bridges UDP/TCP traffic through host sockets; the
custom filesystem-over-Ethernet protocol is dispatched straight to
`FsProto` with no host socket involved.
*/

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpStream, UdpSocket};

use super::checksum;
use super::fsproto::FsProto;

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_EDFS: u16 = 0xEDF5;

const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;

const NET_SOCKET_ACK_WAIT: u8 = 8;
const NET_INACTIVITY_LIMIT: u32 = 64;

pub struct Peer {
    mac: [u8; 6], // the peer's own address, 0x11 repeated (`net.h`'s NET_MAC_REMOTE)
    ip_remote: Ipv4Addr, // the peer's own address, 10.0.0.1
    ip_local: Ipv4Addr,  // the emulated machine's address, 10.0.0.2
    ip_ident: u16,
    fsproto: FsProto,
    udp_sockets: HashMap<u16, UdpSocket>,
    tcp_sockets: HashMap<u16, TcpSession>,
}

struct TcpSession {
    stream: TcpStream,
    local_port: u16,
    remote_port: u16,
    seq: u32,
    ack: u32,
    ack_wait: u8,
    inactivity: u32,
    closing: bool,
}

impl Peer {
    pub fn new(fsproto_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            mac: [0x11; 6],
            ip_remote: Ipv4Addr::new(10, 0, 0, 1),
            ip_local: Ipv4Addr::new(10, 0, 0, 2),
            ip_ident: 1,
            fsproto: FsProto::new(fsproto_root),
            udp_sockets: HashMap::new(),
            tcp_sockets: HashMap::new(),
        }
    }

    /// Inspects one outgoing (host-bound, i.e. transmitted-by-the-CPU)
    /// Ethernet frame and returns zero or more reply frames to deliver
    /// back to the NIC as received frames.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        if frame.len() < 14 {
            return Vec::new();
        }
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        match ethertype {
            ETHERTYPE_ARP => self.handle_arp(frame).into_iter().collect(),
            ETHERTYPE_IPV4 => self.handle_ipv4(frame),
            ETHERTYPE_EDFS => self.handle_edfs(frame).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Per-scheduler-tick housekeeping: poll active UDP/TCP sockets for
    /// inbound data and turn it into RX frames.
    pub fn tick(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        self.poll_udp(&mut frames);
        self.poll_tcp(&mut frames);
        frames
    }

    fn src_mac(frame: &[u8]) -> [u8; 6] {
        frame[6..12].try_into().unwrap()
    }

    fn handle_arp(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 42 {
            return None;
        }
        let arp = &frame[14..42];
        let opcode = u16::from_be_bytes([arp[6], arp[7]]);
        if opcode != 1 {
            return None; // only requests are answered
        }
        let target_ip = Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]);
        if target_ip != self.ip_remote && target_ip != self.ip_local {
            return None;
        }
        let sender_mac = Self::src_mac(frame);
        let sender_ip = Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]);

        let mut reply = vec![0u8; 42];
        reply[0..6].copy_from_slice(&sender_mac);
        reply[6..12].copy_from_slice(&self.mac);
        reply[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        reply[14..16].copy_from_slice(&[0x00, 0x01]); // hw type ethernet
        reply[16..18].copy_from_slice(&[0x08, 0x00]); // proto type IPv4
        reply[18] = 6;
        reply[19] = 4;
        reply[20..22].copy_from_slice(&[0x00, 0x02]); // reply
        reply[22..28].copy_from_slice(&self.mac);
        reply[28..32].copy_from_slice(&target_ip.octets());
        reply[32..38].copy_from_slice(&sender_mac);
        reply[38..42].copy_from_slice(&sender_ip.octets());
        Some(reply)
    }

    fn handle_ipv4(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        if frame.len() < 34 {
            return Vec::new();
        }
        let ip = &frame[14..];
        let ihl = (ip[0] & 0x0F) as usize * 4;
        if frame.len() < 14 + ihl {
            return Vec::new();
        }
        let proto = ip[9];
        let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
        let src_mac = Self::src_mac(frame);
        let payload = &frame[14 + ihl..];

        match proto {
            IP_PROTO_ICMP => self.handle_icmp(src_mac, dst_ip, payload).into_iter().collect(),
            IP_PROTO_UDP => self.handle_udp(src_mac, dst_ip, payload),
            IP_PROTO_TCP => self.handle_tcp(src_mac, payload).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn handle_icmp(&mut self, src_mac: [u8; 6], dst_ip: Ipv4Addr, icmp: &[u8]) -> Option<Vec<u8>> {
        if dst_ip != self.ip_remote || icmp.len() < 8 || icmp[0] != 8 {
            return None; // only echo-request to the peer's own IP
        }
        let mut reply_icmp = icmp.to_vec();
        reply_icmp[0] = 0; // echo reply
        reply_icmp[2] = 0;
        reply_icmp[3] = 0;
        let csum = checksum::ones_complement(&reply_icmp, false);
        reply_icmp[2..4].copy_from_slice(&csum.to_be_bytes());
        let ident = self.next_ip_ident();
        Some(self.build_ipv4_frame(src_mac, self.ip_remote, self.ip_local, IP_PROTO_ICMP, ident, &reply_icmp))
    }

    fn next_ip_ident(&mut self) -> u16 {
        let id = self.ip_ident;
        self.ip_ident = self.ip_ident.wrapping_add(1);
        id
    }

    fn build_ipv4_frame(&self, dst_mac: [u8; 6], src_ip: Ipv4Addr, dst_ip: Ipv4Addr, proto: u8, ident: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(14 + 20 + payload.len());
        frame.extend_from_slice(&dst_mac);
        frame.extend_from_slice(&self.mac);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let total_len = 20 + payload.len();
        let mut header = [0u8; 20];
        header[0] = 0x45;
        header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        header[4..6].copy_from_slice(&ident.to_be_bytes());
        header[8] = 64; // TTL
        header[9] = proto;
        header[12..16].copy_from_slice(&src_ip.octets());
        header[16..20].copy_from_slice(&dst_ip.octets());
        let csum = checksum::ones_complement(&header, false);
        header[10..12].copy_from_slice(&csum.to_be_bytes());

        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);
        frame
    }

    fn handle_udp(&mut self, src_mac: [u8; 6], dst_ip: Ipv4Addr, udp: &[u8]) -> Vec<Vec<u8>> {
        if udp.len() < 8 {
            return Vec::new();
        }
        let src_port = u16::from_be_bytes([udp[0], udp[1]]);
        let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
        let payload = &udp[8..];

        if dst_ip == Ipv4Addr::new(255, 255, 255, 255) && (dst_port == 67 || dst_port == 68) {
            return self.handle_dhcp(src_mac, src_port, payload).into_iter().collect();
        }

        let socket = self.udp_sockets.entry(src_port).or_insert_with(|| {
            let sock = UdpSocket::bind("0.0.0.0:0").expect("bind ephemeral UDP socket");
            sock.set_nonblocking(true).expect("set UDP socket nonblocking");
            sock
        });
        let _ = socket.send_to(payload, (dst_ip, dst_port));
        Vec::new()
    }

    fn poll_udp(&mut self, frames: &mut Vec<Vec<u8>>) {
        let mut buf = [0u8; 1500];
        for (&src_port, socket) in self.udp_sockets.iter() {
            while let Ok((n, from)) = socket.recv_from(&mut buf) {
                let std::net::SocketAddr::V4(from4) = from else { continue };
                let mut udp = Vec::with_capacity(8 + n);
                udp.extend_from_slice(&from4.port().to_be_bytes());
                udp.extend_from_slice(&src_port.to_be_bytes());
                udp.extend_from_slice(&((8 + n) as u16).to_be_bytes());
                udp.extend_from_slice(&[0, 0]);
                udp.extend_from_slice(&buf[..n]);
                let csum = checksum::ones_complement(&udp, true);
                udp[6..8].copy_from_slice(&csum.to_be_bytes());
                let ident = self.next_ip_ident();
                // Unsolicited push, no captured request frame to echo a
                // destination MAC from; use the emulated machine's fixed
                // address (`net.h`'s NET_MAC_LOCAL), same as `poll_tcp`.
                frames.push(self.build_ipv4_frame([0x22; 6], *from4.ip(), self.ip_local, IP_PROTO_UDP, ident, &udp));
            }
        }
    }

    fn handle_dhcp(&mut self, src_mac: [u8; 6], src_port: u16, bootp: &[u8]) -> Option<Vec<u8>> {
        if bootp.len() < 240 {
            return None;
        }
        let xid = &bootp[4..8];
        let msg_type = bootp[240..].iter().copied().find(|_| true); // options parsed loosely below
        let is_discover = find_dhcp_option(&bootp[240..], 53).map(|v| v[0] == 1).unwrap_or(false);
        let _ = msg_type;
        let reply_type: u8 = if is_discover { 2 } else { 5 }; // OFFER or ACK

        let mut reply = vec![0u8; 300];
        reply[0] = 2; // BOOTREPLY
        reply[1] = 1; // htype ethernet
        reply[2] = 6; // hlen
        reply[4..8].copy_from_slice(xid);
        reply[16..20].copy_from_slice(&self.ip_local.octets()); // yiaddr
        reply[20..24].copy_from_slice(&self.ip_remote.octets()); // siaddr
        reply[28..34].copy_from_slice(&src_mac);
        reply[236..240].copy_from_slice(&[0x63, 0x82, 0x53, 0x63]); // magic cookie
        reply[240] = 53;
        reply[241] = 1;
        reply[242] = reply_type;
        reply[243] = 1; // subnet mask option
        reply[244] = 4;
        reply[245..249].copy_from_slice(&[255, 255, 255, 0]);
        reply[249] = 54; // server identifier
        reply[250] = 4;
        reply[251..255].copy_from_slice(&self.ip_remote.octets());
        reply[255] = 0xFF; // end

        let mut udp = Vec::with_capacity(8 + reply.len());
        udp.extend_from_slice(&67u16.to_be_bytes());
        udp.extend_from_slice(&src_port.to_be_bytes());
        udp.extend_from_slice(&((8 + reply.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(&reply);
        let csum = checksum::ones_complement(&udp, true);
        udp[6..8].copy_from_slice(&csum.to_be_bytes());

        let ident = self.next_ip_ident();
        Some(self.build_ipv4_frame(src_mac, self.ip_remote, Ipv4Addr::new(255, 255, 255, 255), IP_PROTO_UDP, ident, &udp))
    }

    fn handle_tcp(&mut self, src_mac: [u8; 6], segment: &[u8]) -> Option<Vec<u8>> {
        if segment.len() < 20 {
            return None;
        }
        let src_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
        let seq = u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]);
        let flags = segment[13];
        let data_offset = ((segment[12] >> 4) as usize) * 4;
        let data = segment.get(data_offset..).unwrap_or(&[]);

        if flags & TCP_RST != 0 {
            self.tcp_sockets.remove(&src_port);
            return None;
        }

        if flags & TCP_SYN != 0 && flags & TCP_ACK == 0 {
            let stream = TcpStream::connect((self.ip_remote, dst_port)).ok()?;
            stream.set_nonblocking(true).ok()?;
            let session = TcpSession {
                stream,
                local_port: dst_port,
                remote_port: src_port,
                seq: 1,
                ack: seq.wrapping_add(1),
                ack_wait: 0,
                inactivity: 0,
                closing: false,
            };
            let reply = self.build_tcp_reply(src_mac, &session, TCP_SYN | TCP_ACK, &[]);
            self.tcp_sockets.insert(src_port, session);
            return Some(reply);
        }

        let session = self.tcp_sockets.get_mut(&src_port)?;
        if flags & TCP_FIN != 0 {
            session.ack = session.ack.wrapping_add(1);
            let initiated_by_peer = session.closing;
            let reply_flags = if initiated_by_peer { TCP_ACK } else { TCP_RST | TCP_ACK };
            let reply = Self::build_tcp_reply_static(&self.mac, src_mac, session, reply_flags, &[]);
            self.tcp_sockets.remove(&src_port);
            return Some(reply);
        }
        if flags & (TCP_PSH | TCP_ACK) != 0 && !data.is_empty() {
            let _ = session.stream.write_all(data);
            session.ack = session.ack.wrapping_add(data.len() as u32);
            session.ack_wait = 0;
            return Some(Self::build_tcp_reply_static(&self.mac, src_mac, session, TCP_ACK, &[]));
        }
        None
    }

    fn build_tcp_reply(&self, dst_mac: [u8; 6], session: &TcpSession, flags: u8, data: &[u8]) -> Vec<u8> {
        Self::build_tcp_reply_static(&self.mac, dst_mac, session, flags, data)
    }

    fn build_tcp_reply_static(my_mac: &[u8; 6], dst_mac: [u8; 6], session: &TcpSession, flags: u8, data: &[u8]) -> Vec<u8> {
        let mut segment = vec![0u8; 20 + data.len()];
        segment[0..2].copy_from_slice(&session.local_port.to_be_bytes());
        segment[2..4].copy_from_slice(&session.remote_port.to_be_bytes());
        segment[4..8].copy_from_slice(&session.seq.to_be_bytes());
        segment[8..12].copy_from_slice(&session.ack.to_be_bytes());
        segment[12] = 5 << 4;
        segment[13] = flags;
        segment[14..16].copy_from_slice(&4096u16.to_be_bytes()); // window
        segment[20..].copy_from_slice(data);

        let mut frame = Vec::with_capacity(14 + 20 + segment.len());
        frame.extend_from_slice(&dst_mac);
        frame.extend_from_slice(my_mac);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let total_len = 20 + segment.len();
        let mut ip_header = [0u8; 20];
        ip_header[0] = 0x45;
        ip_header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip_header[8] = 64;
        ip_header[9] = IP_PROTO_TCP;
        ip_header[12..16].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 1).octets());
        ip_header[16..20].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
        let csum = checksum::ones_complement(&ip_header, false);
        ip_header[10..12].copy_from_slice(&csum.to_be_bytes());

        frame.extend_from_slice(&ip_header);
        frame.extend_from_slice(&segment);
        frame
    }

    fn poll_tcp(&mut self, frames: &mut Vec<Vec<u8>>) {
        let my_mac = self.mac;
        let mut to_close = Vec::new();
        for (&port, session) in self.tcp_sockets.iter_mut() {
            if session.ack_wait > 0 {
                session.ack_wait -= 1;
                continue;
            }
            let mut buf = [0u8; 1500];
            match session.stream.read(&mut buf) {
                Ok(0) => {
                    session.closing = true;
                    // No captured request frame to echo a destination MAC
                    // from here (this is an unsolicited push); use the
                    // emulated machine's fixed address (`net.h`'s
                    // NET_MAC_LOCAL).
                    let reply = Self::build_tcp_reply_static(&my_mac, [0x22; 6], session, TCP_FIN | TCP_ACK, &[]);
                    frames.push(reply);
                    to_close.push(port);
                }
                Ok(n) => {
                    session.inactivity = 0;
                    session.seq = session.seq.wrapping_add(n as u32);
                    session.ack_wait = NET_SOCKET_ACK_WAIT;
                    let reply = Self::build_tcp_reply_static(&my_mac, [0x22; 6], session, TCP_PSH | TCP_ACK, &buf[..n]);
                    frames.push(reply);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    session.inactivity += 1;
                    if session.inactivity > NET_INACTIVITY_LIMIT {
                        to_close.push(port);
                    }
                }
                Err(_) => to_close.push(port),
            }
        }
        for port in to_close {
            self.tcp_sockets.remove(&port);
        }
    }

    fn handle_edfs(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 0x3C {
            return None;
        }
        let func = frame[0x3B];
        let payload = &frame[0x3C..];
        let resp = self.fsproto.dispatch(func, payload);

        let mut reply = frame[..0x3C].to_vec();
        reply[0x3A] = (resp.result & 0xFF) as u8;
        reply[0x3B] = (resp.result >> 8) as u8;
        reply.extend_from_slice(&resp.payload);
        reply[0..6].copy_from_slice(&Self::src_mac(frame));
        reply[6..12].copy_from_slice(&self.mac);
        Some(reply)
    }
}

fn find_dhcp_option(options: &[u8], code: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i + 1 < options.len() {
        let opt = options[i];
        if opt == 0xFF {
            break;
        }
        if opt == 0 {
            i += 1;
            continue;
        }
        let len = options[i + 1] as usize;
        if i + 2 + len > options.len() {
            break;
        }
        if opt == code {
            return Some(&options[i + 2..i + 2 + len]);
        }
        i += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icmp_echo_request_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 14 + 20 + 16];
        frame[0..6].copy_from_slice(&[0x11; 6]);
        frame[6..12].copy_from_slice(&[0x22; 6]);
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[14] = 0x45;
        frame[16..18].copy_from_slice(&36u16.to_be_bytes());
        frame[22] = 64;
        frame[23] = IP_PROTO_ICMP;
        frame[26..30].copy_from_slice(&[10, 0, 0, 2]);
        frame[30..34].copy_from_slice(&[10, 0, 0, 1]);
        frame[34] = 8; // echo request
        frame[38..40].copy_from_slice(&1u16.to_be_bytes());
        frame[40..42].copy_from_slice(&1u16.to_be_bytes());
        frame
    }

    #[test]
    fn icmp_echo_request_gets_a_reply_with_swapped_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::new(dir.path());
        let frame = icmp_echo_request_frame();
        let replies = peer.handle_frame(&frame);
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        // dst = original sender (the emulated machine, 0x22); src = the
        // peer's own fixed address (0x11).
        assert_eq!(&reply[0..6], &[0x22; 6]);
        assert_eq!(&reply[6..12], &[0x11; 6]);
        assert_eq!(&reply[26..30], &[10, 0, 0, 1]);
        assert_eq!(&reply[30..34], &[10, 0, 0, 2]);
        assert_eq!(reply[34], 0); // echo reply
    }

    #[test]
    fn arp_request_for_peer_ip_gets_fixed_mac_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::new(dir.path());
        let mut frame = vec![0u8; 42];
        frame[0..6].copy_from_slice(&[0xFF; 6]);
        frame[6..12].copy_from_slice(&[0x11; 6]);
        frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        frame[20..22].copy_from_slice(&[0x00, 0x01]);
        frame[22..28].copy_from_slice(&[0x11; 6]);
        frame[28..32].copy_from_slice(&[10, 0, 0, 2]);
        frame[38..42].copy_from_slice(&[10, 0, 0, 1]);
        let replies = peer.handle_frame(&frame);
        assert_eq!(replies.len(), 1);
        assert_eq!(&replies[0][22..28], &[0x11; 6]);
    }
}
