fn main() {
    // ESP-IDF environment is only needed when cross-compiling for the chip
    // (Xtensa or RISC-V espidf targets); host builds skip it
    if let Ok(target) = std::env::var("TARGET") {
        if target.contains("xtensa") || target.ends_with("-espidf") {
            embuild::espidf::sysenv::output();
        }
    }
}
