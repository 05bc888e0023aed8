/*!
Modem AT scripté pour tests sans matériel

Sert l'autre extrémité d'un pipe `tokio::io::duplex`: chaque ligne reçue est
enregistrée, puis la réponse de la règle dont le préfixe correspond le mieux est
renvoyée. Une ligne sans règle reçoit `ERROR`.
*/

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

#[derive(Debug, Clone)]
enum Reply {
    Bytes(Vec<u8>),
    Silence,
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    replies: VecDeque<Reply>,
}

#[derive(Debug, Default)]
struct ModemState {
    rules: Vec<Rule>,
    received: Vec<String>,
}

/// Modem simulé: règles de réponse par préfixe de commande
#[derive(Clone, Default)]
pub struct ScriptedModem {
    state: Arc<Mutex<ModemState>>,
}

impl ScriptedModem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Répond `response` (lignes séparées par CRLF) aux lignes commençant par `prefix`.
    ///
    /// Plusieurs appels pour un même préfixe forment une file; la dernière réponse
    /// est répétée indéfiniment.
    pub fn respond(&self, prefix: &str, response: &str) -> &Self {
        self.push(prefix, Reply::Bytes(format!("\r\n{}\r\n", response).into_bytes()))
    }

    /// Réponse envoyée octet pour octet (prompt `> ` sans fin de ligne, etc.)
    pub fn respond_raw(&self, prefix: &str, raw: &str) -> &Self {
        self.push(prefix, Reply::Bytes(raw.as_bytes().to_vec()))
    }

    /// Aucune réponse: simule un module bloqué
    pub fn silence(&self, prefix: &str) -> &Self {
        self.push(prefix, Reply::Silence)
    }

    fn push(&self, prefix: &str, reply: Reply) -> &Self {
        let mut state = self.state.lock().unwrap();
        match state.rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.replies.push_back(reply),
            None => state.rules.push(Rule {
                prefix: prefix.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    /// Ouvre une connexion vers le modem; la tâche de service tourne jusqu'à la fermeture
    pub fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        let state = self.state.clone();

        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(server);
            let mut lines = BufReader::new(reader).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                let reply = Self::reply_for(&state, &line);
                log::debug!("[MODEM] {} -> {:?}", line, reply);

                if let Reply::Bytes(bytes) = reply {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            }
        });

        client
    }

    fn reply_for(state: &Arc<Mutex<ModemState>>, line: &str) -> Reply {
        let mut state = state.lock().unwrap();
        state.received.push(line.to_string());

        let rule = state
            .rules
            .iter_mut()
            .filter(|rule| line.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len());

        match rule {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front().unwrap_or(Reply::Silence),
            Some(rule) => rule.replies.front().cloned().unwrap_or(Reply::Silence),
            None => Reply::Bytes(b"\r\nERROR\r\n".to_vec()),
        }
    }

    /// Toutes les lignes reçues, dans l'ordre
    pub fn received(&self) -> Vec<String> {
        self.state.lock().unwrap().received.clone()
    }

    /// Lignes reçues commençant par `prefix`
    pub fn received_matching(&self, prefix: &str) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|line| line.starts_with(prefix))
            .collect()
    }
}
