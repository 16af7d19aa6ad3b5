//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use mgmd_utils::task::{IntervalTask, TimeoutTask};
use tokio::sync::mpsc::Sender;

use crate::version::Version;

//
// mgmd tasks diagram:
//                                    +--------------+
//                                    |  northbound  |
//                                    +--------------+
//                                          |
//                                          | (1x)
//                                          V
//                                    +--------------+
//    general_query_interval (Nx) ->  |              |
//     other_querier_timeout (Nx) ->  |              |
//             group_timeout (Nx) ->  |              |
//      group_query_interval (Nx) ->  |   instance   | -> (1x) fea
//            source_timeout (Nx) ->  |              | -> (1x) finder
//      host_present_timeout (Nx) ->  |              | -> (Nx) subscribers
//         fea_retry_timeout (0/1x)-> |              |
//  membership_retry_timeout (0/1x)-> |              |
//                                    +--------------+
//                                          ^
//                                          | (1x)
//                                    +--------------+
//                                    |     bus      |
//                                    +--------------+
//

// mgmd inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    use crate::version::Version;

    // Type aliases.
    pub type ProtocolInputMsg<V> = input::ProtocolMsg<V>;

    // Input messages (child task -> main task).
    pub mod input {
        use super::*;

        #[derive(Debug, Deserialize, Serialize)]
        #[serde(bound = "V: Version")]
        pub enum ProtocolMsg<V: Version> {
            GeneralQueryInterval(GeneralQueryIntervalMsg),
            OtherQuerierTimeout(OtherQuerierTimeoutMsg),
            GroupTimeout(GroupTimeoutMsg<V>),
            GroupQueryInterval(GroupQueryIntervalMsg<V>),
            SourceTimeout(SourceTimeoutMsg<V>),
            HostPresentTimeout(HostPresentTimeoutMsg<V>),
            FeaRetryTimeout(FeaRetryTimeoutMsg),
            MembershipRetryTimeout(MembershipRetryTimeoutMsg),
        }

        // Time to send the next General Query.
        #[derive(Debug, Deserialize, Serialize)]
        pub struct GeneralQueryIntervalMsg {
            pub ifindex: u32,
        }

        // The Other Querier Present timer has expired.
        #[derive(Debug, Deserialize, Serialize)]
        pub struct OtherQuerierTimeoutMsg {
            pub ifindex: u32,
        }

        // A group timer has expired.
        #[derive(Debug, Deserialize, Serialize)]
        #[serde(bound = "V: Version")]
        pub struct GroupTimeoutMsg<V: Version> {
            pub ifindex: u32,
            pub group: V::IpAddr,
        }

        // Time to retransmit Group-Specific or Group-and-Source-Specific
        // Queries.
        #[derive(Debug, Deserialize, Serialize)]
        #[serde(bound = "V: Version")]
        pub struct GroupQueryIntervalMsg<V: Version> {
            pub ifindex: u32,
            pub group: V::IpAddr,
        }

        // A source timer has expired.
        #[derive(Debug, Deserialize, Serialize)]
        #[serde(bound = "V: Version")]
        pub struct SourceTimeoutMsg<V: Version> {
            pub ifindex: u32,
            pub group: V::IpAddr,
            pub source: V::IpAddr,
        }

        // An older-version-host-present timer has expired.
        #[derive(Debug, Deserialize, Serialize)]
        #[serde(bound = "V: Version")]
        pub struct HostPresentTimeoutMsg<V: Version> {
            pub ifindex: u32,
            pub group: V::IpAddr,
            pub timer: crate::group::OlderHostTimer,
        }

        // Time to dispatch the head of the FEA request queue again.
        #[derive(Debug, Deserialize, Serialize)]
        pub struct FeaRetryTimeoutMsg {}

        // Time to dispatch the head of the membership notification queue
        // again.
        #[derive(Debug, Deserialize, Serialize)]
        pub struct MembershipRetryTimeoutMsg {}
    }
}

// ===== mgmd tasks =====

// Periodic General Query transmission.
pub(crate) fn general_query_interval(
    ifindex: u32,
    interval: Duration,
    general_query_intervalp: &Sender<
        messages::input::GeneralQueryIntervalMsg,
    >,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let general_query_intervalp = general_query_intervalp.clone();
        IntervalTask::new(interval, false, move || {
            let general_query_intervalp = general_query_intervalp.clone();
            async move {
                let msg = messages::input::GeneralQueryIntervalMsg { ifindex };
                let _ = general_query_intervalp.send(msg).await;
            }
        })
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}

// Other Querier Present timeout.
pub(crate) fn other_querier_present_timer(
    ifindex: u32,
    timeout: Duration,
    other_querier_timeoutp: &Sender<messages::input::OtherQuerierTimeoutMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let other_querier_timeoutp = other_querier_timeoutp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::OtherQuerierTimeoutMsg { ifindex };
            let _ = other_querier_timeoutp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Group timer.
pub(crate) fn group_timer<V>(
    ifindex: u32,
    group: V::IpAddr,
    timeout: Duration,
    group_timeoutp: &Sender<messages::input::GroupTimeoutMsg<V>>,
) -> TimeoutTask
where
    V: Version,
{
    #[cfg(not(feature = "testing"))]
    {
        let group_timeoutp = group_timeoutp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::GroupTimeoutMsg { ifindex, group };
            let _ = group_timeoutp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Periodic Group-Specific and Group-and-Source-Specific Query
// retransmission.
pub(crate) fn group_query_timer<V>(
    ifindex: u32,
    group: V::IpAddr,
    interval: Duration,
    group_query_intervalp: &Sender<messages::input::GroupQueryIntervalMsg<V>>,
) -> IntervalTask
where
    V: Version,
{
    #[cfg(not(feature = "testing"))]
    {
        let group_query_intervalp = group_query_intervalp.clone();
        IntervalTask::new(interval, false, move || {
            let group_query_intervalp = group_query_intervalp.clone();
            async move {
                let msg =
                    messages::input::GroupQueryIntervalMsg { ifindex, group };
                let _ = group_query_intervalp.send(msg).await;
            }
        })
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}

// Source timer.
pub(crate) fn source_timer<V>(
    ifindex: u32,
    group: V::IpAddr,
    source: V::IpAddr,
    timeout: Duration,
    source_timeoutp: &Sender<messages::input::SourceTimeoutMsg<V>>,
) -> TimeoutTask
where
    V: Version,
{
    #[cfg(not(feature = "testing"))]
    {
        let source_timeoutp = source_timeoutp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::SourceTimeoutMsg {
                ifindex,
                group,
                source,
            };
            let _ = source_timeoutp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Older-version-host-present timeout.
pub(crate) fn host_present_timer<V>(
    ifindex: u32,
    group: V::IpAddr,
    timer: crate::group::OlderHostTimer,
    timeout: Duration,
    host_present_timeoutp: &Sender<messages::input::HostPresentTimeoutMsg<V>>,
) -> TimeoutTask
where
    V: Version,
{
    #[cfg(not(feature = "testing"))]
    {
        let host_present_timeoutp = host_present_timeoutp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::HostPresentTimeoutMsg {
                ifindex,
                group,
                timer,
            };
            let _ = host_present_timeoutp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// FEA request queue retry timeout.
pub(crate) fn fea_retry_timer(
    timeout: Duration,
    fea_retry_timeoutp: &Sender<messages::input::FeaRetryTimeoutMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let fea_retry_timeoutp = fea_retry_timeoutp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::FeaRetryTimeoutMsg {};
            let _ = fea_retry_timeoutp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Membership notification queue retry timeout.
pub(crate) fn membership_retry_timer(
    timeout: Duration,
    membership_retry_timeoutp: &Sender<
        messages::input::MembershipRetryTimeoutMsg,
    >,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let membership_retry_timeoutp = membership_retry_timeoutp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::MembershipRetryTimeoutMsg {};
            let _ = membership_retry_timeoutp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}
