//! Symbolic key names and mouse buttons mapped to xdotool's vocabulary.

/// Lookup table from lower-cased key names to X keysym names.
const KEYS: &[(&str, &str)] = &[
    ("alt", "Alt_L"),
    ("alt_left", "Alt_L"),
    ("alt_right", "Alt_R"),
    ("backspace", "BackSpace"),
    ("break", "Pause"),
    ("caps_lock", "Caps_Lock"),
    ("cmd", "Super_L"),
    ("command", "Super_L"),
    ("control", "Control_L"),
    ("control_left", "Control_L"),
    ("control_right", "Control_R"),
    ("ctrl", "Control_L"),
    ("del", "Delete"),
    ("delete", "Delete"),
    ("down", "Down"),
    ("end", "End"),
    ("enter", "Return"),
    ("esc", "Escape"),
    ("escape", "Escape"),
    ("f1", "F1"),
    ("f2", "F2"),
    ("f3", "F3"),
    ("f4", "F4"),
    ("f5", "F5"),
    ("f6", "F6"),
    ("f7", "F7"),
    ("f8", "F8"),
    ("f9", "F9"),
    ("f10", "F10"),
    ("f11", "F11"),
    ("f12", "F12"),
    ("home", "Home"),
    ("insert", "Insert"),
    ("left", "Left"),
    ("menu", "Menu"),
    ("meta", "Meta_L"),
    ("num_lock", "Num_Lock"),
    ("page_down", "Page_Down"),
    ("page_up", "Page_Up"),
    ("pause", "Pause"),
    ("print", "Print"),
    ("right", "Right"),
    ("scroll_lock", "Scroll_Lock"),
    ("shift", "Shift_L"),
    ("shift_left", "Shift_L"),
    ("shift_right", "Shift_R"),
    ("space", "space"),
    ("super", "Super_L"),
    ("super_left", "Super_L"),
    ("super_right", "Super_R"),
    ("tab", "Tab"),
    ("up", "Up"),
    ("win", "Super_L"),
    ("windows", "Super_L"),
];

/// Separator xdotool understands as "press together".
pub const COMBO_SEPARATOR: &str = "+";

/// Map a symbolic key name to the keysym xdotool expects.
///
/// Matching is case-insensitive. Unknown names are returned lower-cased so
/// xdotool itself reports anything invalid.
pub fn map_key(key: &str) -> String {
    let lower = key.to_lowercase();
    KEYS.iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, keysym)| (*keysym).to_string())
        .unwrap_or(lower)
}

/// Map a chord of key names, e.g. `["ctrl", "shift", "t"]` → `Control_L+Shift_L+t`.
pub fn map_combo<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter()
        .map(|k| map_key(k.as_ref()))
        .collect::<Vec<_>>()
        .join(COMBO_SEPARATOR)
}

/// Mouse buttons, numbered as xdotool numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

impl MouseButton {
    pub fn number(self) -> u8 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
        }
    }
}

/// Wheel direction; xdotool models the wheel as buttons 4 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

impl ScrollDirection {
    pub fn button(self) -> u8 {
        match self {
            ScrollDirection::Up => 4,
            ScrollDirection::Down => 5,
        }
    }
}
