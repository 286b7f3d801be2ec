//! TOML block definitions.

use serde::Deserialize;

/// Top-level `blocks.toml` schema.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BlocksConfig {
    #[serde(default)]
    pub blocks: Vec<BlockDef>,
}

/// One block definition. Most fields are optional with derived defaults:
/// `blocks_skylight` follows `solid`, `opaque` follows `solid`.
#[derive(Clone, Debug, Deserialize)]
pub struct BlockDef {
    pub name: String,
    pub solid: Option<bool>,
    pub opaque: Option<bool>,
    pub blocks_skylight: Option<bool>,
    /// Light lost per block traversed (clamped to at least 1 during
    /// propagation). Opaque blocks default to 15.
    pub light_attenuation: Option<u8>,
    /// Emitted block light, 0-15.
    pub light_emission: Option<u8>,
    /// Handlers receive random ticks only when set.
    pub random_ticks: Option<bool>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_block() {
        let cfg: BlocksConfig = toml::from_str(
            r#"
            [[blocks]]
            name = "karst:glowstone"
            solid = true
            light_emission = 15

            [[blocks]]
            name = "karst:glass"
            solid = true
            opaque = false
            blocks_skylight = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.blocks[0].light_emission, Some(15));
        assert_eq!(cfg.blocks[1].opaque, Some(false));
        assert!(cfg.blocks[1].tags.is_empty());
    }
}
