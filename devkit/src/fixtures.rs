/*!
Fixtures pour construire des données conformes aux formats de l'agent

- `RegisterImage`: bloc de registres d'entrée, flottants en paires (mot bas, mot haut)
- `NmeaBuilder`: trames GGA et réponses `+QGPSGNMEA`
- `manifest`: document de version pour la mise à jour
*/

use serde_json::{json, Value};

/// Trame de référence (Munich, 48°07.038'N 11°31.000'E)
pub const GGA_MUNICH: &str = "$GPGGA,123456,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

/// Image d'un bloc de registres d'entrée
#[derive(Debug, Clone)]
pub struct RegisterImage {
    words: Vec<u16>,
}

impl RegisterImage {
    pub fn new(len: usize) -> Self {
        Self { words: vec![0; len] }
    }

    /// Écrit `value` à `offset`: mot bas puis mot haut
    pub fn float(mut self, offset: usize, value: f32) -> Self {
        let bits = value.to_bits();
        self.words[offset] = (bits & 0xFFFF) as u16;
        self.words[offset + 1] = (bits >> 16) as u16;
        self
    }

    pub fn words(self) -> Vec<u16> {
        self.words
    }
}

/// Construit des trames GGA à partir de degrés décimaux
pub struct NmeaBuilder;

impl NmeaBuilder {
    /// Trame GGA avec latitude `ddmm.mmmm` et longitude `dddmm.mmmm`
    pub fn gga(latitude: f64, longitude: f64) -> String {
        let (lat, ns) = Self::to_nmea(latitude, 2, 'N', 'S');
        let (lon, ew) = Self::to_nmea(longitude, 3, 'E', 'W');
        format!(
            "$GPGGA,101500.00,{},{},{},{},1,09,0.8,120.0,M,47.0,M,,*5A",
            lat, ns, lon, ew
        )
    }

    /// Trame GGA sans position (pas de fix)
    pub fn gga_no_fix() -> String {
        "$GPGGA,101500.00,,,,,0,00,99.9,,,,,,*48".to_string()
    }

    /// Réponse complète du module pour `AT+QGPSGNMEA="GGA"`
    pub fn gnmea_response(sentence: &str) -> String {
        format!("+QGPSGNMEA: {}\r\nOK", sentence)
    }

    fn to_nmea(value: f64, width: usize, positive: char, negative: char) -> (String, char) {
        let hemisphere = if value < 0.0 { negative } else { positive };
        let value = value.abs();
        let degrees = value.trunc();
        let minutes = (value - degrees) * 60.0;
        (
            format!("{:0width$}{:07.4}", degrees as u32, minutes, width = width),
            hemisphere,
        )
    }
}

/// Manifeste de mise à jour
pub fn manifest(version: &str, firmware_url: &str, sha256: Option<&str>) -> Value {
    let mut doc = json!({
        "version": version,
        "firmware_url": firmware_url,
    });
    if let Some(digest) = sha256 {
        doc["sha256"] = json!(digest);
    }
    doc
}
