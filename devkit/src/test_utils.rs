/*!
Test Harness pour meter-agent

Facilite l'écriture de tests de bout en bout avec:
- Modem scripté pré-configuré (GNSS prêt, broker qui accepte)
- Serveur HTTP pour manifestes/firmwares
- Assertions sur les payloads publiés
*/

use crate::fixtures::NmeaBuilder;
use crate::http_stub::HttpStub;
use crate::modem_stub::ScriptedModem;
use anyhow::Result;
use serde_json::Value;

/// Commandes de la séquence de publication, dans l'ordre
pub const PUBLISH_SEQUENCE: &[&str] = &[
    "AT+QIACT=1",
    "AT+QMTCFG=\"recv/mode\"",
    "AT+QMTOPEN=",
    "AT+QMTOPEN?",
    "AT+QMTCONN=",
    "AT+QMTPUBEX=",
    "{",
    "AT+QMTDISC=",
];

/// Harness de test complet: un modem, un serveur HTTP
pub struct TestHarness {
    pub modem: ScriptedModem,
    pub http: HttpStub,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub async fn new() -> Result<Self> {
        env_logger::builder().is_test(true).try_init().ok();

        Ok(Self {
            modem: ScriptedModem::new(),
            http: HttpStub::start().await?,
        })
    }

    /// GNSS déjà démarré, chaque lecture renvoie `sentence`
    pub fn gnss_ready_with(&self, sentence: &str) -> &Self {
        self.modem.respond("AT+QGPSLOC=2", "+QGPSLOC: 101500.0,0,0,0,0,2,0,0,0,0,0\r\nOK");
        self.modem
            .respond("AT+QGPSGNMEA=\"GGA\"", &NmeaBuilder::gnmea_response(sentence));
        self
    }

    /// Positions successives (la dernière est répétée)
    pub fn gnss_track(&self, positions: &[(f64, f64)]) -> &Self {
        self.modem.respond("AT+QGPSLOC=2", "OK");
        for (latitude, longitude) in positions {
            let sentence = NmeaBuilder::gga(*latitude, *longitude);
            self.modem
                .respond("AT+QGPSGNMEA=\"GGA\"", &NmeaBuilder::gnmea_response(&sentence));
        }
        self
    }

    /// Module GNSS qui n'obtient jamais de position
    pub fn gnss_without_fix(&self) -> &Self {
        self.gnss_ready_with(&NmeaBuilder::gga_no_fix())
    }

    /// Broker qui accepte toute la séquence de publication
    pub fn broker_accepting(&self) -> &Self {
        self.modem.respond("AT+QIACT=1", "OK");
        self.modem.respond("AT+QMTCFG=\"recv/mode\"", "OK");
        self.modem.respond("AT+QMTOPEN=", "OK\r\n\r\n+QMTOPEN: 0,0");
        self.modem.respond("AT+QMTOPEN?", "+QMTOPEN: 0,\"broker\",1883\r\nOK");
        self.modem.respond("AT+QMTCONN=", "OK\r\n\r\n+QMTCONN: 0,0,0");
        self.modem.respond_raw("AT+QMTPUBEX=", "\r\n> ");
        self.modem.respond("{", "OK\r\n\r\n+QMTPUBEX: 0,0,0");
        self.modem.respond("AT+QMTDISC=", "OK\r\n\r\n+QMTDISC: 0,0");
        self
    }

    /// Payloads JSON reçus par le modem (lignes de données après le prompt)
    pub fn published_payloads(&self) -> Result<Vec<Value>> {
        self.modem
            .received_matching("{")
            .iter()
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    /// Vérifie qu'une séquence complète de publication a été envoyée `count` fois
    pub fn assert_publish_count(&self, count: usize) -> Result<()> {
        for step in PUBLISH_SEQUENCE {
            let seen = self.modem.received_matching(step).len();
            if seen != count {
                anyhow::bail!("step '{}': expected {} sends, got {}", step, count, seen);
            }
        }
        log::info!("✅ {} complete publish sequence(s)", count);
        Ok(())
    }
}
