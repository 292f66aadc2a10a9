//! Nice-value to scheduler-weight mapping.
//!
//! Verbatim copy of the CFS `prio_to_weight` table from `u-scl/common.h` /
//! `RW-SCL/common.h` in the original source, indexed by `nice + 20`.

/// `prio_to_weight[i]` for `i` in `[0, 40)`, `i = nice + 20`.
pub const PRIO_TO_WEIGHT: [u32; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291,
    /* -15 */ 29154, 23254, 18705, 14949, 11916,
    /* -10 */ 9548, 7620, 6100, 4904, 3906,
    /*  -5 */ 3121, 2501, 1991, 1586, 1277,
    /*   0 */ 1024, 820, 655, 526, 423,
    /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45,
    /*  15 */ 36, 29, 23, 18, 15,
];

/// Current thread's `nice` value, clamped to `[-20, 19]`.
#[cfg(unix)]
pub fn get_nice() -> i32 {
    // getpriority(2) overloads its return value with errno on failure; the
    // kernel never actually fails PRIO_PROCESS(0) on a live thread, so we
    // don't bother disambiguating and just clamp into range.
    let raw = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
    raw.clamp(-20, 19)
}

#[cfg(not(unix))]
pub fn get_nice() -> i32 {
    0
}

/// Weight for the calling thread's current nice value.
pub fn weight_for_current_thread() -> u32 {
    weight_for_nice(get_nice())
}

/// Weight for an explicit nice value, clamped into range.
pub fn weight_for_nice(nice: i32) -> u32 {
    PRIO_TO_WEIGHT[(nice.clamp(-20, 19) + 20) as usize]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nice_zero_is_1024() {
        assert_eq!(weight_for_nice(0), 1024);
    }

    #[test]
    fn table_is_monotonically_decreasing() {
        for w in PRIO_TO_WEIGHT.windows(2) {
            assert!(w[0] > w[1]);
        }
    }

    #[test]
    fn current_thread_weight_is_in_table() {
        let w = weight_for_current_thread();
        assert!(PRIO_TO_WEIGHT.contains(&w));
    }
}
