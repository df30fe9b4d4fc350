use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PlayerError;

/// Cantidad de bandas del ecualizador del nodo (25 Hz a 16 kHz)
pub const EQ_BANDS: u8 = 15;

const MIN_GAIN: f32 = -0.25;
const MAX_GAIN: f32 = 1.0;

/// Una banda del ecualizador. `gain` es un multiplicador: 0.0 no cambia nada.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqBand {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f32,
    pub mono_level: f32,
    pub filter_band: f32,
    pub filter_width: f32,
}

impl Default for Karaoke {
    fn default() -> Self {
        Self {
            level: 1.0,
            mono_level: 1.0,
            filter_band: 220.0,
            filter_width: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

/// Usado tanto por tremolo como por vibrato
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    pub frequency: f32,
    pub depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f32,
}

/// Estado completo de filtros de un player.
///
/// Se serializa tal cual dentro del op `filters`; los campos en `None` se omiten
/// y el nodo los desactiva.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equalizer: Vec<EqBand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Oscillation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Oscillation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Verifica los rangos que acepta el nodo
    pub fn validate(&self) -> Result<(), PlayerError> {
        validate_bands(&self.equalizer)?;

        if let Some(timescale) = &self.timescale {
            if timescale.speed <= 0.0 || timescale.pitch <= 0.0 || timescale.rate <= 0.0 {
                return Err(invalid("timescale debe ser mayor que 0"));
            }
        }
        if let Some(tremolo) = &self.tremolo {
            if tremolo.frequency <= 0.0 || tremolo.depth <= 0.0 || tremolo.depth > 1.0 {
                return Err(invalid("tremolo: frecuencia > 0 y profundidad en (0, 1]"));
            }
        }
        if let Some(vibrato) = &self.vibrato {
            if vibrato.frequency <= 0.0 || vibrato.frequency > 14.0 {
                return Err(invalid("vibrato: frecuencia en (0, 14]"));
            }
            if vibrato.depth <= 0.0 || vibrato.depth > 1.0 {
                return Err(invalid("vibrato: profundidad en (0, 1]"));
            }
        }
        if let Some(low_pass) = &self.low_pass {
            if low_pass.smoothing < 1.0 {
                return Err(invalid("low_pass: smoothing debe ser >= 1"));
            }
        }

        Ok(())
    }

    /// Aplica un preset de ecualizador conservando los demás filtros
    pub fn with_equalizer(mut self, bands: Vec<EqBand>) -> Self {
        self.equalizer = bands;
        self
    }
}

pub(crate) fn validate_bands(bands: &[EqBand]) -> Result<(), PlayerError> {
    for band in bands {
        if band.band >= EQ_BANDS {
            return Err(invalid(&format!("banda {} inexistente (0-{})", band.band, EQ_BANDS - 1)));
        }
        if !(MIN_GAIN..=MAX_GAIN).contains(&band.gain) {
            return Err(invalid(&format!(
                "ganancia fuera de rango en banda {}: {} (debe estar entre {} y {})",
                band.band, band.gain, MIN_GAIN, MAX_GAIN
            )));
        }
    }
    Ok(())
}

fn invalid(reason: &str) -> PlayerError {
    PlayerError::InvalidFilter(reason.to_string())
}

/// Presets de ecualizador expresados en las 15 bandas del nodo
pub struct EqPresets;

impl EqPresets {
    pub fn flat() -> Vec<EqBand> {
        Vec::new()
    }

    pub fn bass() -> Vec<EqBand> {
        bands(&[0.20, 0.15, 0.10, 0.05, 0.0, -0.05])
    }

    pub fn pop() -> Vec<EqBand> {
        bands(&[-0.02, -0.01, 0.08, 0.10, 0.15, 0.10, 0.03, -0.02, -0.035, -0.05])
    }

    pub fn rock() -> Vec<EqBand> {
        bands(&[
            0.15, 0.12, 0.08, 0.03, -0.03, -0.05, -0.02, 0.02, 0.06, 0.10, 0.12, 0.12, 0.10, 0.08,
            0.08,
        ])
    }

    pub fn classical() -> Vec<EqBand> {
        bands(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -0.05, -0.05, -0.05, -0.07, -0.07, -0.07, -0.09])
    }

    pub fn electronic() -> Vec<EqBand> {
        bands(&[
            0.15, 0.12, 0.05, 0.0, -0.05, 0.05, 0.03, 0.0, 0.05, 0.10, 0.12, 0.12, 0.10, 0.10, 0.10,
        ])
    }

    /// Obtiene un preset por nombre
    pub fn get(name: &str) -> Option<Vec<EqBand>> {
        let preset = match name.to_lowercase().as_str() {
            "flat" | "normal" => Self::flat(),
            "bass" => Self::bass(),
            "pop" => Self::pop(),
            "rock" => Self::rock(),
            "classical" => Self::classical(),
            "electronic" => Self::electronic(),
            _ => return None,
        };
        info!("🎛️ Preset '{}' seleccionado", name);
        Some(preset)
    }

    /// Lista todos los presets disponibles
    pub fn list() -> Vec<&'static str> {
        vec!["flat", "bass", "pop", "rock", "classical", "electronic"]
    }
}

fn bands(gains: &[f32]) -> Vec<EqBand> {
    gains
        .iter()
        .enumerate()
        .map(|(band, &gain)| EqBand {
            band: band as u8,
            gain,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn presets_are_valid() {
        for name in EqPresets::list() {
            let bands = EqPresets::get(name).unwrap();
            assert!(validate_bands(&bands).is_ok(), "preset {} inválido", name);
        }
        assert!(EqPresets::get("inexistente").is_none());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let loud = Filters::default().with_equalizer(vec![EqBand { band: 3, gain: 1.5 }]);
        assert!(matches!(loud.validate(), Err(PlayerError::InvalidFilter(_))));

        let missing_band = Filters::default().with_equalizer(vec![EqBand { band: 15, gain: 0.1 }]);
        assert!(missing_band.validate().is_err());

        let vibrato = Filters {
            vibrato: Some(Oscillation {
                frequency: 20.0,
                depth: 0.5,
            }),
            ..Filters::default()
        };
        assert!(vibrato.validate().is_err());

        let timescale = Filters {
            timescale: Some(Timescale {
                speed: 0.0,
                ..Timescale::default()
            }),
            ..Filters::default()
        };
        assert!(timescale.validate().is_err());
    }

    #[test]
    fn empty_fields_are_not_serialized() {
        let filters = Filters {
            timescale: Some(Timescale {
                speed: 1.25,
                pitch: 1.0,
                rate: 1.0,
            }),
            low_pass: Some(LowPass { smoothing: 20.0 }),
            ..Filters::default()
        };

        let json = serde_json::to_value(&filters).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "timescale": { "speed": 1.25, "pitch": 1.0, "rate": 1.0 },
                "lowPass": { "smoothing": 20.0 }
            })
        );
        assert!(Filters::default().is_empty());
    }
}
