//! Binary connection-list import/export.
//!
//! Serialises the slave/connection configuration into a Sercos-list
//! framed buffer: 2 bytes actual length, 2 bytes maximum length, then the
//! body. All fields little-endian:
//!
//! ```text
//! body: [slave count u16]
//!       per slave:  addr u16 · flags u16 · fsp u16 · conn count u16
//!       per conn:   class u8 · slot u8 · length u16 · cycle u16 ·
//!                   losses u16 · idn count u16 · idn u32 …
//! ```
//!
//! Import rejects inconsistent framing before touching the body and
//! range-validates every slave entry afterwards.

use crate::config::{ConnConfig, SlaveConfig, TelegramClass};
use crate::error::ConfigError;
use crate::slave::FspProfile;

/// Length of the list header (actual length, maximum length).
pub const LIST_HEADER_LEN: usize = 4;

/// Slave entry flag: device may join via hot-plug.
const FLAG_HOT_PLUG: u16 = 0x0001;

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

pub fn export(configs: &[SlaveConfig]) -> Vec<u8> {
    let mut body = Vec::new();
    put_u16(&mut body, configs.len() as u16);

    for cfg in configs {
        put_u16(&mut body, cfg.address);
        let mut flags = 0u16;
        if cfg.hot_plug {
            flags |= FLAG_HOT_PLUG;
        }
        put_u16(&mut body, flags);
        put_u16(&mut body, cfg.fsp.map_or(0, |f| f as u16));
        put_u16(&mut body, cfg.connections.len() as u16);

        for conn in &cfg.connections {
            body.push(match conn.class {
                TelegramClass::Mdt => 0,
                TelegramClass::At => 1,
            });
            body.push(conn.slot);
            put_u16(&mut body, conn.length);
            put_u16(&mut body, conn.cycle_multiple);
            put_u16(&mut body, conn.accepted_losses);
            put_u16(&mut body, conn.idns.len() as u16);
            for idn in &conn.idns {
                body.extend_from_slice(&idn.to_le_bytes());
            }
        }
    }

    let mut out = Vec::with_capacity(LIST_HEADER_LEN + body.len());
    put_u16(&mut out, body.len() as u16);
    put_u16(&mut out, body.len() as u16);
    out.extend_from_slice(&body);
    out
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

pub fn import(bytes: &[u8]) -> Result<Vec<SlaveConfig>, ConfigError> {
    if bytes.len() < LIST_HEADER_LEN {
        return Err(ConfigError::ListFraming);
    }
    let actual = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    let max = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if actual > max || bytes.len() < LIST_HEADER_LEN + actual {
        return Err(ConfigError::ListFraming);
    }

    let mut rd = Reader {
        body: &bytes[LIST_HEADER_LEN..LIST_HEADER_LEN + actual],
        pos: 0,
    };

    let count = rd.u16()?;
    let mut configs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let address = rd.u16()?;
        let flags = rd.u16()?;
        let fsp = match rd.u16()? {
            0 => None,
            code => Some(FspProfile::from_code(code).ok_or(ConfigError::ListFraming)?),
        };
        let conn_count = rd.u16()?;

        let mut connections = Vec::with_capacity(conn_count as usize);
        for _ in 0..conn_count {
            let class = match rd.u8()? {
                0 => TelegramClass::Mdt,
                1 => TelegramClass::At,
                _ => return Err(ConfigError::ListFraming),
            };
            let slot = rd.u8()?;
            let length = rd.u16()?;
            let cycle_multiple = rd.u16()?;
            let accepted_losses = rd.u16()?;
            let idn_count = rd.u16()?;
            let mut idns = Vec::with_capacity(idn_count as usize);
            for _ in 0..idn_count {
                idns.push(rd.u32()?);
            }
            connections.push(ConnConfig {
                class,
                slot,
                length,
                cycle_multiple,
                accepted_losses,
                idns,
            });
        }

        let cfg = SlaveConfig {
            address,
            fsp,
            hot_plug: flags & FLAG_HOT_PLUG != 0,
            connections,
        };
        cfg.validate()?;
        configs.push(cfg);
    }

    if rd.pos != rd.body.len() {
        return Err(ConfigError::ListFraming);
    }
    Ok(configs)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

struct Reader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8, ConfigError> {
        let b = *self.body.get(self.pos).ok_or(ConfigError::ListFraming)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, ConfigError> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn u32(&mut self) -> Result<u32, ConfigError> {
        let lo = self.u16()?;
        let hi = self.u16()?;
        Ok(u32::from(lo) | u32::from(hi) << 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<SlaveConfig> {
        vec![
            SlaveConfig {
                address: 2,
                fsp: Some(FspProfile::Drive),
                hot_plug: false,
                connections: vec![ConnConfig {
                    class: TelegramClass::Mdt,
                    slot: 0,
                    length: 8,
                    cycle_multiple: 1,
                    accepted_losses: 3,
                    idns: vec![135, 47],
                }],
            },
            SlaveConfig {
                address: 7,
                fsp: None,
                hot_plug: true,
                connections: Vec::new(),
            },
        ]
    }

    #[test]
    fn export_import_preserves_the_configuration() {
        let exported = export(&sample());
        let imported = import(&exported).unwrap();
        assert_eq!(imported.len(), 2);
        assert_eq!(imported[0].address, 2);
        assert_eq!(imported[0].fsp, Some(FspProfile::Drive));
        assert_eq!(imported[0].connections[0].idns, vec![135, 47]);
        assert!(imported[1].hot_plug);
    }

    #[test]
    fn header_carries_the_body_length() {
        let exported = export(&sample());
        let actual = u16::from_le_bytes([exported[0], exported[1]]) as usize;
        assert_eq!(exported.len(), LIST_HEADER_LEN + actual);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut exported = export(&sample());
        exported.truncate(exported.len() - 3);
        assert_eq!(import(&exported).unwrap_err(), ConfigError::ListFraming);
    }

    #[test]
    fn actual_longer_than_max_is_rejected() {
        let mut exported = export(&sample());
        // max length below actual
        exported[2] = 0;
        exported[3] = 0;
        assert_eq!(import(&exported).unwrap_err(), ConfigError::ListFraming);
    }

    #[test]
    fn trailing_garbage_in_body_is_rejected() {
        let configs = sample();
        let mut exported = export(&configs);
        let actual = u16::from_le_bytes([exported[0], exported[1]]) + 2;
        exported[0..2].copy_from_slice(&actual.to_le_bytes());
        exported[2..4].copy_from_slice(&actual.to_le_bytes());
        exported.extend_from_slice(&[0xAB, 0xCD]);
        assert_eq!(import(&exported).unwrap_err(), ConfigError::ListFraming);
    }

    #[test]
    fn bad_slave_entry_fails_validation() {
        let mut cfgs = sample();
        cfgs[0].address = 0;
        let exported = export(&cfgs);
        assert!(matches!(
            import(&exported).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(import(&[]).unwrap_err(), ConfigError::ListFraming);
        assert_eq!(import(&[1, 0]).unwrap_err(), ConfigError::ListFraming);
    }
}
