fn main() -> anyhow::Result<()> {
    vigild::vg::main()
}
