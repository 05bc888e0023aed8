/*!
Serveur HTTP/1.1 minimal pour tester le téléchargement de manifestes et firmwares

Une route par chemin, réponse fixe (statut + corps), compteur d'appels par chemin.
Écoute sur `127.0.0.1:0`, une connexion = une requête (`Connection: close`).
*/

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
enum Route {
    Respond { status: u16, body: Vec<u8> },
    /// Ferme la connexion sans réponse
    Hangup,
}

#[derive(Debug, Default)]
struct StubState {
    routes: HashMap<String, Route>,
    hits: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct HttpStub {
    addr: SocketAddr,
    state: Arc<Mutex<StubState>>,
}

impl HttpStub {
    /// Démarre le serveur sur un port libre
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(StubState::default()));

        let serve_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = serve_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = Self::handle(stream, state).await {
                        log::warn!("[HTTP] connection error: {}", e);
                    }
                });
            }
        });

        log::info!("[HTTP] stub listening on {}", addr);
        Ok(Self { addr, state })
    }

    /// URL absolue pour `path` (ex: `/version.json`)
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn route(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) -> &Self {
        self.state.lock().unwrap().routes.insert(
            path.to_string(),
            Route::Respond {
                status,
                body: body.into(),
            },
        );
        self
    }

    pub fn hangup(&self, path: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(path.to_string(), Route::Hangup);
        self
    }

    /// Nombre de requêtes reçues sur `path`
    pub fn hits(&self, path: &str) -> usize {
        self.state.lock().unwrap().hits.get(path).copied().unwrap_or(0)
    }

    async fn handle(mut stream: TcpStream, state: Arc<Mutex<StubState>>) -> Result<()> {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            request.extend_from_slice(&buf[..n]);
        }

        let head = String::from_utf8_lossy(&request);
        let path = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();

        let route = {
            let mut state = state.lock().unwrap();
            *state.hits.entry(path.clone()).or_insert(0) += 1;
            state.routes.get(&path).cloned()
        };

        let (status, body) = match route {
            Some(Route::Respond { status, body }) => (status, body),
            Some(Route::Hangup) => return Ok(()),
            None => (404, b"not found".to_vec()),
        };

        let reason = match status {
            200 => "OK",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "Status",
        };
        let header = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
            status,
            reason,
            body.len()
        );
        stream.write_all(header.as_bytes()).await?;
        stream.write_all(&body).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
