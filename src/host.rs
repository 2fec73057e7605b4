//! The management-plane seam the Michael-failure controller drives. Sending management
//! frames, iterating associated stations, and changing supplicant state all live outside
//! this crate's scope; this trait is the boundary the controller calls through.

/// Identifies a TKIP-using peer the countermeasures sweep should act on.
pub trait Station {
    /// True once the station has fully associated (countermeasures never act on a station
    /// that is mid-handshake).
    fn is_associated(&self) -> bool;

    /// True if either this station's pairwise cipher or the BSS group cipher is TKIP.
    fn uses_tkip(&self) -> bool;
}

/// Reason code carried on a deauthentication, mirroring 802.11's `REASON_MIC_FAILURE`.
pub const REASON_MIC_FAILURE: u16 = 14;

/// External collaborator implemented by the surrounding station/AP stack.
pub trait ManagementPlane {
    type Station: Station;

    /// AP mode: every currently associated station, for the countermeasures deauth sweep.
    fn stations(&self) -> Vec<Self::Station>;

    /// Send a deauthentication frame to `station` (AP mode) or to the current AP
    /// (station mode, where the argument is `None`).
    fn send_deauth(&self, station: Option<&Self::Station>, reason: u16);

    /// Station mode only: send an EAPOL-Key Michael-MIC-Failure report carrying `tsc`.
    fn send_mic_failure_report(&self, tsc: u64);

    /// Station mode only: drop the current association and return to scanning.
    fn transition_to_scan(&self);

    /// AP mode only: refuse new TKIP associations while countermeasures are active.
    fn set_tkip_associations_refused(&self, refused: bool);
}
