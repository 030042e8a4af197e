//! TCP_INFO snapshots for the in-band upload measurements. Only linux
//! exposes the counters we need; elsewhere the TCPInfo section is simply
//! omitted.

use std::collections::BTreeMap;

#[cfg(target_os = "linux")]
pub(crate) fn snapshot(fd: i32) -> Option<BTreeMap<&'static str, i64>> {
    use std::mem;

    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rv = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rv != 0 {
        return None;
    }

    let mut map = BTreeMap::new();
    map.insert("RTO", info.tcpi_rto as i64);
    map.insert("RTT", info.tcpi_rtt as i64);
    map.insert("RTTVar", info.tcpi_rttvar as i64);
    map.insert("SndMSS", info.tcpi_snd_mss as i64);
    map.insert("RcvMSS", info.tcpi_rcv_mss as i64);
    map.insert("Unacked", info.tcpi_unacked as i64);
    map.insert("Lost", info.tcpi_lost as i64);
    map.insert("Retrans", info.tcpi_retrans as i64);
    map.insert("SndCwnd", info.tcpi_snd_cwnd as i64);
    map.insert("SndSsthresh", info.tcpi_snd_ssthresh as i64);
    map.insert("TotalRetrans", info.tcpi_total_retrans as i64);
    map.insert("PMTU", info.tcpi_pmtu as i64);
    Some(map)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn snapshot(_fd: i32) -> Option<BTreeMap<&'static str, i64>> {
    None
}
