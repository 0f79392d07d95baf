use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{
    ConstantCombinedRateMetronome, EmptyMetronome, IntervalMetronome, Metronome, MetronomeKind,
    MetronomeSettings, SharedSchedule, WaitStrategy, build_metronomes,
};

const INTERVAL: Duration = Duration::from_millis(100);
const STALL: Duration = Duration::from_millis(250);

#[test]
fn coordinated_omission_returns_scheduled_time_after_stall() -> Result<(), String> {
    let mut metronome = IntervalMetronome::sleeping(INTERVAL, true);
    let first = metronome.wait_for_next();
    std::thread::sleep(STALL);
    let second = metronome.wait_for_next();
    let third = metronome.wait_for_next();
    if second.duration_since(first) != INTERVAL {
        return Err(format!("Gap {:?} is not the interval", second.duration_since(first)));
    }
    if third.duration_since(second) != INTERVAL {
        return Err(format!("Gap {:?} is not the interval", third.duration_since(second)));
    }
    Ok(())
}

#[test]
fn without_coordinated_omission_returns_wall_clock_after_stall() -> Result<(), String> {
    let mut metronome = IntervalMetronome::busy_spinning(INTERVAL, false);
    let first = metronome.wait_for_next();
    std::thread::sleep(STALL);
    let before = Instant::now();
    let second = metronome.wait_for_next();
    if second < before {
        return Err("Returned a timestamp before the call".to_owned());
    }
    if second.duration_since(first) < STALL {
        return Err(format!("Gap {:?} is shorter than the stall", second.duration_since(first)));
    }
    // The grid restarts from the late call.
    let third = metronome.wait_for_next();
    if third.duration_since(second) < INTERVAL {
        return Err(format!("Gap {:?} burst to catch up", third.duration_since(second)));
    }
    Ok(())
}

#[test]
fn first_slot_is_within_one_interval() -> Result<(), String> {
    for _ in 0..5 {
        let start = Instant::now();
        let mut metronome = IntervalMetronome::sleeping(Duration::from_millis(20), true);
        let first = metronome.wait_for_next();
        if first.duration_since(start) > Duration::from_millis(20) {
            return Err(format!("First slot {:?} too late", first.duration_since(start)));
        }
    }
    Ok(())
}

#[test]
fn combined_rate_hands_out_each_slot_once() -> Result<(), String> {
    let interval = Duration::from_millis(2);
    let schedule = SharedSchedule::new(interval);
    let slots = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let mut metronome =
            ConstantCombinedRateMetronome::new(schedule.clone(), WaitStrategy::Park, true);
        let slots = slots.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..10 {
                let slot = metronome.wait_for_next();
                if let Ok(mut slots) = slots.lock() {
                    slots.push(slot);
                }
            }
        }));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_err| "metronome thread panicked".to_owned())?;
    }
    let mut slots = slots
        .lock()
        .map_err(|_err| "slot lock poisoned".to_owned())?
        .clone();
    slots.sort();
    if slots.len() != 40 {
        return Err(format!("Expected 40 slots, got {}", slots.len()));
    }
    for pair in slots.windows(2) {
        let (Some(earlier), Some(later)) = (pair.first(), pair.get(1)) else {
            continue;
        };
        if later.duration_since(*earlier) != interval {
            return Err(format!("Slots {:?} apart", later.duration_since(*earlier)));
        }
    }
    Ok(())
}

#[test]
fn build_uses_empty_metronome_without_interval() -> Result<(), String> {
    let settings = MetronomeSettings {
        kind: MetronomeKind::Sleeping,
        interval_us: 0,
        account_for_coordinated_omission: true,
    };
    let mut metronomes = build_metronomes(&settings, 3);
    if metronomes.len() != 3 {
        return Err(format!("Expected 3 metronomes, got {}", metronomes.len()));
    }
    let start = Instant::now();
    for metronome in &mut metronomes {
        metronome.wait_for_next();
    }
    if start.elapsed() > Duration::from_millis(50) {
        return Err("Unpaced metronomes blocked".to_owned());
    }
    let mut empty = EmptyMetronome;
    if empty.wait_for_next() < start {
        return Err("Empty metronome returned a past timestamp".to_owned());
    }
    Ok(())
}
