use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        // Second OCTOSPI and SDMMC instances, with their delay blocks.
        dlyb2: { any(feature = "u575", feature = "u585") },
        // I2C4 isn't present on the smaller parts.
        i2c4: { any(feature = "u575", feature = "u585") },
        // USART2 is absent on U535/U545.
        usart2: { any(feature = "u575", feature = "u585") },
        tim8: { any(feature = "u575", feature = "u585") },
    }
}
