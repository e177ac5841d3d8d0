//! On-disk lease persistence.
//!
//! The file holds the raw header and option bytes up to the end marker.

use super::message::{Message, DHCP_FIXED_LEN};
use crate::error::{ClientError, DecodeError};
use std::{
    io,
    path::Path,
    time::{Duration, SystemTime},
};
use tokio::fs;

/// A lease read back from disk and how long ago it was written.
#[derive(Debug, Clone)]
pub struct StoredLease {
    pub message: Message,
    pub age: Duration,
}

/// Persists `msg`. BOOTP replies are never stored; an existing file is
/// removed instead.
pub async fn write_lease(path: &Path, msg: &Message) -> Result<(), ClientError> {
    if !msg.is_dhcp() {
        return remove_lease(path).await;
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    fs::write(path, msg.persisted_bytes()).await?;
    Ok(())
}

/// Loads the stored lease, `Ok(None)` when there is none.
pub async fn read_lease(path: &Path) -> Result<Option<StoredLease>, ClientError> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if data.len() < DHCP_FIXED_LEN {
        return Err(DecodeError::Truncated {
            needed: DHCP_FIXED_LEN,
            available: data.len(),
        }
        .into());
    }
    let message = Message::parse(&data)?;
    if !message.is_dhcp() {
        return Err(DecodeError::NotDhcp.into());
    }

    let modified = fs::metadata(path).await?.modified()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(Some(StoredLease { message, age }))
}

pub async fn remove_lease(path: &Path) -> Result<(), ClientError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v4::message::{BOOTREPLY, MAGIC_COOKIE};
    use std::net::Ipv4Addr;

    fn ack() -> Message {
        Message {
            op: BOOTREPLY,
            xid: 7,
            yiaddr: Ipv4Addr::new(10, 0, 0, 5),
            cookie: MAGIC_COOKIE,
            options: vec![53, 1, 5, 51, 4, 0, 0, 0x0e, 0x10, 255, 0, 0, 0xba, 0xad],
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases").join("eth0.lease");
        write_lease(&path, &ack()).await.unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), DHCP_FIXED_LEN + 10);

        let stored = read_lease(&path).await.unwrap().unwrap();
        assert_eq!(stored.message.yiaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(stored.message.option_u32(51).unwrap(), Some(3600));
        assert!(stored.age < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_bootp_reply_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eth0.lease");
        write_lease(&path, &ack()).await.unwrap();
        assert!(path.exists());

        let bootp = Message {
            cookie: 0,
            options: Vec::new(),
            ..ack()
        };
        write_lease(&path, &bootp).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eth0.lease");
        assert!(read_lease(&path).await.unwrap().is_none());
        remove_lease(&path).await.unwrap();

        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(matches!(
            read_lease(&path).await,
            Err(ClientError::Decode(DecodeError::Truncated { .. }))
        ));
    }
}
