/*!
# Meter DevKit - Stubs et utilitaires de test pour meter-agent

Bibliothèque facilitant les tests de l'agent sans matériel:
- Modem AT scripté sur un pipe `tokio::io::duplex` (enregistre chaque ligne reçue)
- Serveur HTTP minimal pour manifestes et firmwares
- Fixtures: images de registres Modbus, trames NMEA, manifestes
- Harness combinant modem + HTTP
*/

pub mod modem_stub;
pub mod http_stub;
pub mod fixtures;
pub mod test_utils;

pub use modem_stub::ScriptedModem;
pub use http_stub::HttpStub;
pub use fixtures::{RegisterImage, NmeaBuilder};
pub use test_utils::TestHarness;
