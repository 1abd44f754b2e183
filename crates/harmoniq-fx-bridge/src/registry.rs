use harmoniq_fx_client::{EffectError, EffectResult, EffectUuid, ParamId, ParamValue};
use serde::{Deserialize, Serialize};

/// Shape of one engine parameter. Values must be exactly `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub id: ParamId,
    pub name: String,
    pub size: usize,
    pub default: ParamValue,
}

impl ParamSpec {
    pub fn i32(id: u32, name: impl Into<String>, default: i32) -> Self {
        Self {
            id: ParamId(id),
            name: name.into(),
            size: 4,
            default: ParamValue::from_i32(default),
        }
    }

    pub fn i16(id: u32, name: impl Into<String>, default: i16) -> Self {
        Self {
            id: ParamId(id),
            name: name.into(),
            size: 2,
            default: ParamValue(default.to_le_bytes().to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectDescriptor {
    pub effect_type: EffectUuid,
    pub implementation: EffectUuid,
    pub name: String,
    pub params: Vec<ParamSpec>,
}

impl EffectDescriptor {
    pub fn param(&self, id: ParamId) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| spec.id == id)
    }
}

pub const EQUALIZER: EffectUuid = EffectUuid(0x0bed4300_ddd6_11db_8f34_0002a5d5c51b);
pub const BASS_BOOST: EffectUuid = EffectUuid(0x0634f220_ddd4_11db_a0fc_0002a5d5c51b);
pub const VIRTUALIZER: EffectUuid = EffectUuid(0x37cc2c00_dddd_11db_8577_0002a5d5c51b);
pub const PRESET_REVERB: EffectUuid = EffectUuid(0x47382d60_ddd8_11db_bf3a_0002a5d5c51b);

struct StockEffect {
    effect_type: EffectUuid,
    implementation: u128,
    name: &'static str,
}

const STOCK_EFFECTS: &[StockEffect] = &[
    StockEffect {
        effect_type: EQUALIZER,
        implementation: 0x6e0c_8a1b_3f0e_4c71_9d0a_4861_726d_6f01,
        name: "Harmoniq Parametric EQ",
    },
    StockEffect {
        effect_type: BASS_BOOST,
        implementation: 0x6e0c_8a1b_3f0e_4c71_9d0a_4861_726d_6f02,
        name: "Harmoniq Bass Boost",
    },
    StockEffect {
        effect_type: VIRTUALIZER,
        implementation: 0x6e0c_8a1b_3f0e_4c71_9d0a_4861_726d_6f03,
        name: "Harmoniq Virtualizer",
    },
    StockEffect {
        effect_type: PRESET_REVERB,
        implementation: 0x6e0c_8a1b_3f0e_4c71_9d0a_4861_726d_6f04,
        name: "Harmoniq Preset Reverb",
    },
];

fn stock_params(effect_type: EffectUuid) -> Vec<ParamSpec> {
    match effect_type {
        EQUALIZER => vec![
            ParamSpec::i16(0, "num_bands", 5),
            ParamSpec::i32(1, "band_level_low", 0),
            ParamSpec::i32(2, "band_level_mid", 0),
            ParamSpec::i32(3, "band_level_high", 0),
            ParamSpec::i16(4, "current_preset", -1),
        ],
        BASS_BOOST | VIRTUALIZER => vec![
            ParamSpec::i32(0, "strength_supported", 1),
            ParamSpec::i16(1, "strength", 0),
        ],
        PRESET_REVERB => vec![ParamSpec::i16(0, "preset", 0)],
        _ => Vec::new(),
    }
}

/// Effect implementations the bridge knows how to instantiate.
#[derive(Debug, Clone, Default)]
pub struct EffectRegistry {
    descriptors: Vec<EffectDescriptor>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stock() -> Self {
        let descriptors = STOCK_EFFECTS
            .iter()
            .map(|stock| EffectDescriptor {
                effect_type: stock.effect_type,
                implementation: EffectUuid(stock.implementation),
                name: stock.name.to_string(),
                params: stock_params(stock.effect_type),
            })
            .collect();
        Self { descriptors }
    }

    pub fn register(&mut self, descriptor: EffectDescriptor) -> EffectResult<()> {
        if self
            .descriptors
            .iter()
            .any(|existing| existing.implementation == descriptor.implementation)
        {
            return Err(EffectError::invalid_argument(format!(
                "implementation {} already registered",
                descriptor.implementation
            )));
        }
        if let Some(spec) = descriptor
            .params
            .iter()
            .find(|spec| spec.size == 0 || spec.default.len() != spec.size)
        {
            return Err(EffectError::invalid_argument(format!(
                "parameter {} of {} has an inconsistent size",
                spec.id.0, descriptor.name
            )));
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Find the descriptor matching a request. An explicit implementation
    /// wins; a bare type resolves to the first registered implementation.
    pub fn resolve(
        &self,
        effect_type: Option<EffectUuid>,
        implementation: Option<EffectUuid>,
    ) -> EffectResult<&EffectDescriptor> {
        let found = match (effect_type, implementation) {
            (_, Some(implementation)) => self
                .descriptors
                .iter()
                .find(|d| d.implementation == implementation)
                .filter(|d| effect_type.map_or(true, |t| t == d.effect_type)),
            (Some(effect_type), None) => {
                self.descriptors.iter().find(|d| d.effect_type == effect_type)
            }
            (None, None) => {
                return Err(EffectError::invalid_argument(
                    "effect type and implementation are both missing",
                ))
            }
        };
        found.ok_or_else(|| EffectError::unavailable("no matching effect implementation"))
    }

    pub fn descriptors(&self) -> &[EffectDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
