//! Minimal DHCPv4 client used to lease the host bridge an address.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dhcproto::v4::{DhcpOption, Flags, Message, MessageType, OptionCode};
use dhcproto::{Decodable, Encodable};
use macaddr::MacAddr6;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

const CLIENT_PORT: u16 = 68;
const SERVER_PORT: u16 = 67;

#[async_trait]
pub trait Dhcp: Send + Sync {
    async fn acquire(&self, interface: &str, mac: MacAddr6) -> Result<IpAddr>;
}

pub fn discover(mac: MacAddr6, xid: u32) -> Message {
    let mut msg = Message::new(
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        mac.as_bytes(),
    );
    msg.set_xid(xid).set_flags(Flags::default().set_broadcast());
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Discover));
    msg.opts_mut().insert(DhcpOption::ParameterRequestList(vec![
        OptionCode::SubnetMask,
        OptionCode::Router,
        OptionCode::DomainNameServer,
    ]));
    msg
}

/// REQUEST for the address in `offer`.
pub fn request(mac: MacAddr6, xid: u32, offer: &Message) -> Result<Message> {
    if offer.opts().msg_type() != Some(MessageType::Offer) {
        bail!("expected DHCP offer, got {:?}", offer.opts().msg_type());
    }
    let server = match offer.opts().get(OptionCode::ServerIdentifier) {
        Some(DhcpOption::ServerIdentifier(ip)) => *ip,
        _ => offer.siaddr(),
    };

    let mut msg = discover(mac, xid);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Request));
    msg.opts_mut()
        .insert(DhcpOption::RequestedIpAddress(offer.yiaddr()));
    msg.opts_mut().insert(DhcpOption::ServerIdentifier(server));
    Ok(msg)
}

/// Leased address from the server's answer to a REQUEST.
pub fn acknowledged_address(reply: &Message) -> Result<Ipv4Addr> {
    match reply.opts().msg_type() {
        Some(MessageType::Ack) => Ok(reply.yiaddr()),
        other => bail!("ACK not received (got {:?})", other),
    }
}

pub struct DhcpClient {
    timeout: Duration,
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl DhcpClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn socket(interface: &str) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        socket
            .bind_device(Some(interface.as_bytes()))
            .with_context(|| format!("unable to bind to {interface}"))?;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = interface;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT).into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn exchange(&self, socket: &UdpSocket, msg: &Message, want: MessageType) -> Result<Message> {
        let server = SocketAddrV4::new(Ipv4Addr::BROADCAST, SERVER_PORT);
        socket.send_to(&msg.to_vec()?, server).await?;

        let xid = msg.xid();
        let mut buf = vec![0u8; 1500];
        let recv = async {
            loop {
                let (n, from) = socket.recv_from(&mut buf).await?;
                let Ok(reply) = Message::from_bytes(&buf[..n]) else {
                    continue;
                };
                if reply.xid() != xid {
                    continue;
                }
                let kind = reply.opts().msg_type();
                debug!("[onprem] dhcp {:?} from {}", kind, from);
                if kind == Some(want) || kind == Some(MessageType::Nak) {
                    return Ok::<_, anyhow::Error>(reply);
                }
            }
        };
        tokio::time::timeout(self.timeout, recv)
            .await
            .with_context(|| format!("no DHCP {:?} within {:?}", want, self.timeout))?
    }
}

#[async_trait]
impl Dhcp for DhcpClient {
    async fn acquire(&self, interface: &str, mac: MacAddr6) -> Result<IpAddr> {
        let socket = Self::socket(interface)?;
        let xid: u32 = rand::random();

        let offer = self
            .exchange(&socket, &discover(mac, xid), MessageType::Offer)
            .await?;
        let ack = self
            .exchange(&socket, &request(mac, xid, &offer)?, MessageType::Ack)
            .await?;
        Ok(IpAddr::V4(acknowledged_address(&ack)?))
    }
}
