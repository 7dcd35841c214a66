/*!
Client TCP du collecteur

Ouvre une connexion par trame, comme le fait un nœud : le collecteur lit
une seule trame par connexion.
*/

use anyhow::Result;
use rfsense_backend::samples::{write_frame, Framing, SampleRecord, SampleSchema};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct FrameWriter {
    addr: SocketAddr,
    framing: Framing,
}

impl FrameWriter {
    pub fn new(addr: SocketAddr, framing: Framing) -> Self {
        Self { addr, framing }
    }

    /// Envoie une trame brute puis ferme la connexion
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut stream = TcpStream::connect(self.addr).await?;
        write_frame(&mut stream, self.framing, payload).await?;
        stream.shutdown().await?;
        log::debug!("📤 sent {} bytes to {}", payload.len(), self.addr);
        Ok(())
    }

    pub async fn send_record(&self, schema: &SampleSchema, record: &SampleRecord) -> Result<()> {
        let payload = schema.encode(record)?;
        self.send(&payload).await
    }

    /// Envoie des octets sans préfixe, quel que soit le framing
    pub async fn send_unframed(&self, bytes: &[u8]) -> Result<()> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(bytes).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
