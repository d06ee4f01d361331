// Depth relay conversion. The bridge keeps no book state; each delta is
// converted and forwarded as-is.

use crate::types::{DepthLevel, DepthUpdate};

use super::events::DepthDeltaEvent;

pub fn to_depth_update(ev: &DepthDeltaEvent) -> DepthUpdate {
    DepthUpdate {
        snapshot: false,
        asks: levels(&ev.asks),
        bids: levels(&ev.bids),
    }
}

fn levels(pairs: &[(f64, f64)]) -> Vec<DepthLevel> {
    pairs
        .iter()
        .map(|&(price, volume)| DepthLevel { price, volume })
        .collect()
}
