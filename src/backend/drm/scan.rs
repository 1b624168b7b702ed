//! Output discovery: connector, mode, encoder/CRTC and primary plane.
//!
//! The selection rules are deliberately simple. The first connected
//! connector that advertises at least one mode wins, its first mode becomes
//! the active mode, and the first plane that can feed the chosen CRTC in the
//! requested format is taken. A kiosk panel has exactly one output; there is
//! nothing to rank.

use anyhow::Context;
use drm::buffer::DrmFourcc;
use drm::control::{connector, crtc, plane, Device as ControlDevice, Mode};
use tracing::{debug, info};

pub struct ScanResult {
    pub connector: connector::Handle,
    pub connector_name: String,
    pub crtc: crtc::Handle,
    /// Bit position of the CRTC in the device's CRTC list, used for
    /// plane compatibility masks.
    pub crtc_index: u32,
    pub plane: plane::Handle,
    pub mode: Mode,
    /// Physical size in millimetres, (0, 0) when the panel does not report
    /// one.
    pub size_mm: (u32, u32),
}

pub fn scan_output(device: &impl ControlDevice, format: DrmFourcc) -> anyhow::Result<ScanResult> {
    let res = device
        .resource_handles()
        .context("error getting resource handles")?;

    let mut connector = None;
    for &handle in res.connectors() {
        let info = match device.get_connector(handle, false) {
            Ok(info) => info,
            Err(err) => {
                debug!("error getting connector {}: {err}", u32::from(handle));
                continue;
            }
        };

        debug!(
            "connector {}: {:?}, {} modes",
            u32::from(handle),
            info.state(),
            info.modes().len(),
        );

        if info.state() == connector::State::Connected && !info.modes().is_empty() {
            connector = Some(info);
            break;
        }
    }
    let connector = connector.context("no connected connector with modes found")?;
    let connector_name = format!("{:?}-{}", connector.interface(), connector.interface_id());

    let mode = connector.modes()[0];
    let size_mm = connector.size().unwrap_or((0, 0));

    // Prefer the encoder/CRTC pair the connector is already routed through.
    let bound = connector
        .current_encoder()
        .and_then(|enc| device.get_encoder(enc).ok())
        .and_then(|info| info.crtc().map(|crtc| (info.handle(), crtc)));

    let mut candidates = Vec::new();
    if bound.is_none() {
        for &enc in connector.encoders() {
            let Ok(info) = device.get_encoder(enc) else {
                continue;
            };
            let compatible = res.filter_crtcs(info.possible_crtcs());
            candidates.push((enc, compatible.first().copied()));
        }
    }

    let (encoder, crtc) =
        select_crtc(bound, &candidates).context("no encoder with a usable CRTC found")?;

    let crtc_ids: Vec<u32> = res.crtcs().iter().map(|&c| u32::from(c)).collect();
    let crtc_index =
        crtc_bit_index(&crtc_ids, u32::from(crtc)).context("CRTC missing from resource list")?;

    let mut selected_plane = None;
    for handle in device.plane_handles().context("error getting plane handles")? {
        let Ok(info) = device.get_plane(handle) else {
            continue;
        };

        let drives_crtc = res.filter_crtcs(info.possible_crtcs()).contains(&crtc);
        if plane_matches(drives_crtc, info.formats(), format as u32) {
            selected_plane = Some(handle);
            break;
        }
    }
    let plane = selected_plane
        .with_context(|| format!("no plane supporting {format:?} on the chosen CRTC"))?;

    info!(
        "{connector_name}: connector {} encoder {} crtc {} (index {crtc_index}) plane {}",
        u32::from(connector.handle()),
        u32::from(encoder),
        u32::from(crtc),
        u32::from(plane),
    );

    Ok(ScanResult {
        connector: connector.handle(),
        connector_name,
        crtc,
        crtc_index,
        plane,
        mode,
        size_mm,
    })
}

/// Picks the encoder/CRTC pair to drive. An already bound pair wins
/// outright; otherwise the first candidate encoder that found a compatible
/// existing CRTC is adopted.
pub(crate) fn select_crtc<E: Copy, C: Copy>(
    bound: Option<(E, C)>,
    candidates: &[(E, Option<C>)],
) -> Option<(E, C)> {
    if bound.is_some() {
        return bound;
    }

    candidates
        .iter()
        .find_map(|&(enc, crtc)| crtc.map(|crtc| (enc, crtc)))
}

/// Position of a CRTC in the device's CRTC list. Capability masks address
/// CRTCs by this bit index rather than by object id.
pub(crate) fn crtc_bit_index(crtcs: &[u32], crtc: u32) -> Option<u32> {
    crtcs.iter().position(|&c| c == crtc).map(|i| i as u32)
}

pub(crate) fn plane_matches(drives_crtc: bool, formats: &[u32], format: u32) -> bool {
    drives_crtc && formats.contains(&format)
}

#[cfg(test)]
mod tests {
    use super::{crtc_bit_index, plane_matches, select_crtc};

    const XRGB8888: u32 = 0x3432_5258;

    #[test]
    fn bound_encoder_wins() {
        // One connected connector whose encoder is already routed to a CRTC:
        // discovery must return exactly that pair, ignoring candidates.
        let picked = select_crtc(Some((31, 41)), &[(32, Some(42))]);
        assert_eq!(picked, Some((31, 41)));
    }

    #[test]
    fn unbound_connector_takes_first_candidate_with_crtc() {
        let candidates = [(30, None), (31, Some(41)), (32, Some(42))];
        assert_eq!(select_crtc::<u32, u32>(None, &candidates), Some((31, 41)));
    }

    #[test]
    fn no_usable_crtc() {
        assert_eq!(select_crtc::<u32, u32>(None, &[(30, None), (31, None)]), None);
        assert_eq!(select_crtc::<u32, u32>(None, &[]), None);
    }

    #[test]
    fn bit_index_matches_resource_order() {
        let crtcs = [40, 41, 42];
        assert_eq!(crtc_bit_index(&crtcs, 40), Some(0));
        assert_eq!(crtc_bit_index(&crtcs, 41), Some(1));
        assert_eq!(crtc_bit_index(&crtcs, 42), Some(2));
        assert_eq!(crtc_bit_index(&crtcs, 43), None);
    }

    #[test]
    fn deterministic_discovery_with_bound_encoder() {
        // The single-output scenario: connector 21, encoder 31 bound to CRTC
        // 41, CRTC list [40, 41]. Every derived value is determined.
        let (encoder, crtc) = select_crtc(Some((31_u32, 41_u32)), &[]).unwrap();
        assert_eq!((encoder, crtc), (31, 41));
        assert_eq!(crtc_bit_index(&[40, 41], crtc), Some(1));
    }

    #[test]
    fn plane_filtering() {
        let formats = [XRGB8888, 0x3433_5258];
        assert!(plane_matches(true, &formats, XRGB8888));
        // Wrong CRTC bit.
        assert!(!plane_matches(false, &formats, XRGB8888));
        // Format not advertised.
        assert!(!plane_matches(true, &[0x3433_5258], XRGB8888));
    }
}
