//! AXFR zone source over TCP
//!
//! Real [`ZoneSource`] implementation backed by hickory. Every call opens
//! a fresh TCP connection to the discovered DNS backend; the endpoint may
//! move between ticks, so there is nothing worth keeping alive.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_client::proto::iocompat::AsyncIoTokioAsStd;
use hickory_client::rr::{DNSClass, Name, RData, RecordType};
use hickory_client::tcp::TcpClientStream;
use tokio::net::TcpStream;
use tokio::time::timeout;

use async_trait::async_trait;

use super::{ZoneRecord, ZoneRecordType, ZoneSource};
use crate::{Error, Result};

/// TCP zone source pointed at one DNS server address
pub struct AxfrZoneSource {
    addr: SocketAddr,
    timeout: Duration,
}

impl AxfrZoneSource {
    /// Create a zone source for the given server address
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    async fn connect(&self) -> Result<AsyncClient> {
        let (stream, sender) = TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(self.addr);
        let (client, background) = timeout(self.timeout, AsyncClient::new(stream, sender, None))
            .await
            .map_err(|_| Error::dns(format!("timeout connecting to {}", self.addr)))?
            .map_err(|e| Error::dns(format!("connect to {} failed: {}", self.addr, e)))?;
        tokio::spawn(background);
        Ok(client)
    }

    fn zone_name(zone: &str) -> Result<Name> {
        Name::from_ascii(zone).map_err(|e| Error::dns(format!("bad zone name {:?}: {}", zone, e)))
    }
}

#[async_trait]
impl ZoneSource for AxfrZoneSource {
    async fn soa_serial(&self, zone: &str) -> Result<u32> {
        let name = Self::zone_name(zone)?;
        let mut client = self.connect().await?;

        let response = timeout(self.timeout, client.query(name, DNSClass::IN, RecordType::SOA))
            .await
            .map_err(|_| Error::dns(format!("timeout querying SOA for {}", zone)))?
            .map_err(|e| Error::dns(format!("SOA query for {} failed: {}", zone, e)))?;

        response
            .answers()
            .iter()
            .find_map(|record| match record.data() {
                Some(RData::SOA(soa)) => Some(soa.serial()),
                _ => None,
            })
            .ok_or_else(|| Error::dns(format!("no SOA record in answer for {}", zone)))
    }

    async fn transfer(&self, zone: &str) -> Result<Vec<ZoneRecord>> {
        let name = Self::zone_name(zone)?;
        let mut client = self.connect().await?;

        let response = timeout(
            self.timeout,
            client.query(name, DNSClass::IN, RecordType::AXFR),
        )
        .await
        .map_err(|_| Error::dns(format!("timeout transferring zone {}", zone)))?
        .map_err(|e| Error::dns(format!("zone transfer for {} failed: {}", zone, e)))?;

        let records = response
            .answers()
            .iter()
            .map(|record| ZoneRecord {
                owner: record.name().to_utf8(),
                record_type: match record.record_type() {
                    RecordType::A => ZoneRecordType::A,
                    RecordType::AAAA => ZoneRecordType::Aaaa,
                    RecordType::CNAME => ZoneRecordType::Cname,
                    _ => ZoneRecordType::Other,
                },
            })
            .collect();
        Ok(records)
    }
}
